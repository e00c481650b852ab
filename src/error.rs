//! 对账引擎错误类型

use thiserror::Error;

/// 对账引擎错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconcileError {
    /// 发票行缺少必填字段，分类前即被拒绝
    #[error("Malformed line {line_id}: {reason}")]
    MalformedLine { line_id: i64, reason: String },

    /// 匹配级联与自动建档均失败
    #[error("No candidate for line {line_id}: {reason}")]
    NoCandidate { line_id: i64, reason: String },

    /// 语义匹配超时 (本地恢复，不向调用方传播)
    #[error("Semantic match timed out after {timeout_ms}ms")]
    ExternalMatchTimeout { timeout_ms: u64 },

    /// 语义匹配服务返回错误
    #[error("Semantic match failed: {0}")]
    SemanticMatch(String),

    /// 商品编码冲突
    #[error("Duplicate catalog key: {0}")]
    DuplicateKey(String),

    /// 重试后仍无法写入商品目录
    #[error("Catalog write failed for '{name}': {reason}")]
    CatalogWriteFailure { name: String, reason: String },

    /// 存在未解决行时尝试确认
    #[error("Invoice {invoice_id} cannot be confirmed: {unresolved} unresolved line(s)")]
    ConfirmPrecondition { invoice_id: i64, unresolved: usize },

    /// 没有任何行的发票不能确认
    #[error("Invoice {0} has no lines to confirm")]
    EmptyInvoice(i64),

    /// 库存入库提交失败，发票保持 in_progress
    #[error("Goods receipt commit failed: {0}")]
    ReceiptCommitFailure(String),

    #[error("Invoice {0} is already confirmed")]
    AlreadyConfirmed(i64),

    #[error("Invoice not found: {0}")]
    InvoiceNotFound(i64),

    #[error("Line not found: {0}")]
    LineNotFound(i64),

    #[error("Catalog entry not found: {0}")]
    CatalogEntryNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for ReconcileError {
    fn from(error: sqlx::Error) -> Self {
        ReconcileError::Storage(error.to_string())
    }
}

impl From<config::ConfigError> for ReconcileError {
    fn from(error: config::ConfigError) -> Self {
        ReconcileError::Config(error.to_string())
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(error: serde_json::Error) -> Self {
        ReconcileError::Storage(format!("serialization: {}", error))
    }
}

/// 对账引擎结果类型
pub type ReconcileResult<T> = Result<T, ReconcileError>;
