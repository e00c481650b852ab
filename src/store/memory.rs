//! 内存存储实现
//!
//! 用于测试和本地开发，使用 RwLock 保护共享数据。

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{CatalogStore, InventoryGateway, ReconciliationRepository};
use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{
    CatalogEntry, GoodsReceipt, GoodsReceiptId, InvoiceReconciliation, NewCatalogEntry, RawLine,
};

/// 内存商品目录，保持插入顺序
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: RwLock<IndexMap<String, CatalogEntry>>,
    creates: AtomicUsize,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<CatalogEntry>) -> Self {
        let map = entries.into_iter().map(|e| (e.id.clone(), e)).collect();
        Self {
            entries: RwLock::new(map),
            creates: AtomicUsize::new(0),
        }
    }

    /// 成功执行的 create 次数 (不含同名复用与冲突)
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn search_candidates(&self, tokens: &[String], limit: usize) -> ReconcileResult<Vec<CatalogEntry>> {
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| {
                let name = e.name.to_lowercase();
                tokens.iter().any(|t| name.contains(t.as_str()))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> ReconcileResult<Option<CatalogEntry>> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn create(&self, entry: &NewCatalogEntry) -> ReconcileResult<CatalogEntry> {
        let mut entries = self.entries.write().await;

        if entries.contains_key(&entry.id) {
            return Err(ReconcileError::DuplicateKey(entry.id.clone()));
        }

        let lower = entry.name.to_lowercase();
        if let Some(existing) = entries.values().find(|e| e.name.to_lowercase() == lower) {
            return Ok(existing.clone());
        }

        let created = entry.clone().into_entry();
        entries.insert(created.id.clone(), created.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }
}

/// 内存对账仓库
#[derive(Debug, Default)]
pub struct MemoryRepository {
    raw_lines: RwLock<HashMap<i64, Vec<RawLine>>>,
    reconciliations: RwLock<HashMap<i64, InvoiceReconciliation>>,
    line_index: RwLock<HashMap<i64, i64>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入上游解析出的原始行
    pub async fn ingest(&self, lines: Vec<RawLine>) {
        let mut raw_lines = self.raw_lines.write().await;
        let mut line_index = self.line_index.write().await;
        for line in lines {
            line_index.insert(line.line_id, line.invoice_id);
            raw_lines.entry(line.invoice_id).or_default().push(line);
        }
    }
}

#[async_trait]
impl ReconciliationRepository for MemoryRepository {
    async fn list_raw_lines(&self, invoice_id: i64) -> ReconcileResult<Vec<RawLine>> {
        Ok(self
            .raw_lines
            .read()
            .await
            .get(&invoice_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load(&self, invoice_id: i64) -> ReconcileResult<Option<InvoiceReconciliation>> {
        Ok(self.reconciliations.read().await.get(&invoice_id).cloned())
    }

    async fn save(&self, reconciliation: &InvoiceReconciliation) -> ReconcileResult<()> {
        self.reconciliations
            .write()
            .await
            .insert(reconciliation.invoice_id, reconciliation.clone());
        Ok(())
    }

    async fn find_invoice_for_line(&self, line_id: i64) -> ReconcileResult<Option<i64>> {
        Ok(self.line_index.read().await.get(&line_id).copied())
    }
}

/// 内存库存，可注入提交失败
#[derive(Debug, Default)]
pub struct MemoryInventory {
    receipts: RwLock<IndexMap<i64, (GoodsReceiptId, GoodsReceipt)>>,
    failures_remaining: AtomicUsize,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来 n 次提交返回错误
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub async fn receipt_count(&self) -> usize {
        self.receipts.read().await.len()
    }

    pub async fn receipt_for(&self, invoice_id: i64) -> Option<GoodsReceipt> {
        self.receipts
            .read()
            .await
            .get(&invoice_id)
            .map(|(_, r)| r.clone())
    }
}

#[async_trait]
impl InventoryGateway for MemoryInventory {
    async fn commit_receipt(&self, receipt: &GoodsReceipt) -> ReconcileResult<GoodsReceiptId> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ReconcileError::ReceiptCommitFailure(format!(
                "inventory unavailable for invoice {}",
                receipt.invoice_id
            )));
        }

        let mut receipts = self.receipts.write().await;
        if let Some((id, _)) = receipts.get(&receipt.invoice_id) {
            return Ok(id.clone());
        }

        let id = GoodsReceiptId(format!("GR-{}-{}", receipt.invoice_id, receipts.len() + 1));
        receipts.insert(receipt.invoice_id, (id.clone(), receipt.clone()));
        Ok(id)
    }
}
