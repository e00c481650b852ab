use crate::error::ReconcileError;
use crate::models::{
    AutoMatchSummary, CatalogEntry, InvoiceReconciliation, MatchResult, ValidationReport,
};
use crate::service::ReconciliationService;
use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 请求体: 人工指定的目录条目
#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub catalog_entry_id: String,
}

/// 查询参数: 目录检索
#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    pub limit: Option<usize>,
}

/// 响应体
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// 确认结果
#[derive(Debug, Serialize)]
pub struct ConfirmData {
    pub invoice_id: i64,
    pub receipt_id: String,
}

fn status_for(error: &ReconcileError) -> StatusCode {
    match error {
        ReconcileError::InvoiceNotFound(_)
        | ReconcileError::LineNotFound(_)
        | ReconcileError::CatalogEntryNotFound(_) => StatusCode::NOT_FOUND,
        ReconcileError::AlreadyConfirmed(_) => StatusCode::CONFLICT,
        ReconcileError::ConfirmPrecondition { .. }
        | ReconcileError::EmptyInvoice(_)
        | ReconcileError::MalformedLine { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ReconcileError::ReceiptCommitFailure(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn ok<T: Serialize>(message: String, data: T) -> Response {
    let response = ApiResponse {
        success: true,
        message,
        data: Some(data),
    };
    (StatusCode::OK, Json(response)).into_response()
}

fn failure(error: ReconcileError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::error!("request failed: {}", error);
    }
    let response = ApiResponse::<()> {
        success: false,
        message: format!("Error: {}", error),
        data: None,
    };
    (status, Json(response)).into_response()
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 解析并匹配发票
pub async fn parse_and_match(
    State(service): State<Arc<ReconciliationService>>,
    Path(invoice_id): Path<i64>,
) -> Response {
    match service.parse_and_match(invoice_id).await {
        Ok(results) => ok::<Vec<MatchResult>>(
            format!("Parsed {} lines of invoice {}", results.len(), invoice_id),
            results,
        ),
        Err(e) => failure(e),
    }
}

/// 人工指定候选
pub async fn override_match(
    State(service): State<Arc<ReconciliationService>>,
    Path(line_id): Path<i64>,
    Json(req): Json<OverrideRequest>,
) -> Response {
    match service.override_match(line_id, &req.catalog_entry_id).await {
        Ok(result) => ok::<MatchResult>(
            format!("Line {} matched to {}", line_id, req.catalog_entry_id),
            result,
        ),
        Err(e) => failure(e),
    }
}

/// 批量自动匹配
pub async fn auto_match(
    State(service): State<Arc<ReconciliationService>>,
    Path(invoice_id): Path<i64>,
) -> Response {
    match service.auto_match_high_confidence(invoice_id).await {
        Ok(summary) => ok::<AutoMatchSummary>(
            format!(
                "Auto-matched {} lines, {} need review",
                summary.matched_count, summary.needs_review
            ),
            summary,
        ),
        Err(e) => failure(e),
    }
}

/// 确认发票
pub async fn confirm(
    State(service): State<Arc<ReconciliationService>>,
    Path(invoice_id): Path<i64>,
) -> Response {
    match service.confirm(invoice_id).await {
        Ok(receipt_id) => ok(
            format!("Invoice {} confirmed", invoice_id),
            ConfirmData {
                invoice_id,
                receipt_id: receipt_id.0,
            },
        ),
        Err(e) => failure(e),
    }
}

/// 查询对账状态
pub async fn get_reconciliation(
    State(service): State<Arc<ReconciliationService>>,
    Path(invoice_id): Path<i64>,
) -> Response {
    match service.reconciliation(invoice_id).await {
        Ok(reconciliation) => {
            let counts = reconciliation.counts();
            ok::<InvoiceReconciliation>(
                format!(
                    "{} lines: {} matched, {} needs review, {} unmatched",
                    counts.total, counts.matched, counts.needs_review, counts.unmatched
                ),
                reconciliation,
            )
        }
        Err(e) => failure(e),
    }
}

/// 确认前校验
pub async fn validate(
    State(service): State<Arc<ReconciliationService>>,
    Path(invoice_id): Path<i64>,
) -> Response {
    match service.validate(invoice_id).await {
        Ok(report) => ok::<ValidationReport>(
            if report.can_confirm {
                "Invoice can be confirmed".to_string()
            } else {
                format!("{} validation error(s)", report.errors.len())
            },
            report,
        ),
        Err(e) => failure(e),
    }
}

/// 目录检索，供人工指定时选择条目
pub async fn search_catalog(
    State(service): State<Arc<ReconciliationService>>,
    Query(params): Query<SearchParams>,
) -> Response {
    match service.search_catalog(&params.q, params.limit).await {
        Ok(entries) => ok::<Vec<CatalogEntry>>(
            format!("Found {} catalog entries", entries.len()),
            entries,
        ),
        Err(e) => failure(e),
    }
}

/// 导出审计 CSV
pub async fn export_csv(
    State(service): State<Arc<ReconciliationService>>,
    Path(invoice_id): Path<i64>,
) -> Response {
    match service.export_csv(invoice_id).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"reconciliation-{}.csv\"", invoice_id),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => failure(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&ReconcileError::InvoiceNotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&ReconcileError::AlreadyConfirmed(1)), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&ReconcileError::ConfirmPrecondition {
                invoice_id: 1,
                unresolved: 2
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&ReconcileError::ReceiptCommitFailure("down".to_string())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&ReconcileError::Storage("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
