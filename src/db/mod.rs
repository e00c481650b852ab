pub mod pool;
pub mod postgres;
pub mod queries;

pub use pool::create_pool;
pub use postgres::{PgCatalog, PgInventory, PgRepository};
