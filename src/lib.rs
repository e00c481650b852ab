pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod semantic;
pub mod service;
pub mod store;

pub use config::AppConfig;
pub use db::create_pool;
pub use error::{ReconcileError, ReconcileResult};
pub use service::ReconciliationService;
