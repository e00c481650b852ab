pub mod handlers;

pub use handlers::*;

use crate::service::ReconciliationService;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// 对账接口路由
pub fn router(service: Arc<ReconciliationService>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/invoices/:id", get(get_reconciliation))
        .route("/api/invoices/:id/parse-match", post(parse_and_match))
        .route("/api/invoices/:id/auto-match", post(auto_match))
        .route("/api/invoices/:id/confirm", post(confirm))
        .route("/api/invoices/:id/validation", get(validate))
        .route("/api/invoices/:id/export", get(export_csv))
        .route("/api/lines/:line_id/match", post(override_match))
        .route("/api/catalog/search", get(search_catalog))
        .with_state(service)
}
