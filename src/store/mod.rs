//! 存储抽象
//!
//! 商品目录、对账状态、库存入库均为外部协作方，引擎只通过以下 trait 访问。

pub mod memory;

use async_trait::async_trait;

use crate::error::ReconcileResult;
use crate::models::{
    CatalogEntry, GoodsReceipt, GoodsReceiptId, InvoiceReconciliation, NewCatalogEntry, RawLine,
};

pub use memory::{MemoryCatalog, MemoryInventory, MemoryRepository};

/// 商品目录
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// 按名称关键词检索候选，结果顺序稳定，最多 limit 条
    async fn search_candidates(&self, tokens: &[String], limit: usize) -> ReconcileResult<Vec<CatalogEntry>>;

    async fn get(&self, id: &str) -> ReconcileResult<Option<CatalogEntry>>;

    /// 新建条目
    ///
    /// 编码冲突返回 `DuplicateKey`；同名 (不区分大小写) 条目已存在时返回已有条目。
    async fn create(&self, entry: &NewCatalogEntry) -> ReconcileResult<CatalogEntry>;
}

/// 发票行与对账状态
#[async_trait]
pub trait ReconciliationRepository: Send + Sync {
    async fn list_raw_lines(&self, invoice_id: i64) -> ReconcileResult<Vec<RawLine>>;

    /// 尚未开始对账时返回 None
    async fn load(&self, invoice_id: i64) -> ReconcileResult<Option<InvoiceReconciliation>>;

    async fn save(&self, reconciliation: &InvoiceReconciliation) -> ReconcileResult<()>;

    async fn find_invoice_for_line(&self, line_id: i64) -> ReconcileResult<Option<i64>>;
}

/// 库存入库，按 invoice_id 幂等
#[async_trait]
pub trait InventoryGateway: Send + Sync {
    async fn commit_receipt(&self, receipt: &GoodsReceipt) -> ReconcileResult<GoodsReceiptId>;
}
