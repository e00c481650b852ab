//! 存储 trait 的 PostgreSQL 实现

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;

use super::queries::{self, LineResultRecord, ReconciliationHeaderRow};
use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{
    CatalogEntry, GoodsReceipt, GoodsReceiptId, InvoiceReconciliation, MatchResult,
    NewCatalogEntry, RawLine,
};
use crate::store::{CatalogStore, InventoryGateway, ReconciliationRepository};

/// 唯一约束冲突
const UNIQUE_VIOLATION: &str = "23505";
const CATALOG_NAME_INDEX: &str = "uq_catalog_product_name";

fn unique_constraint(error: &sqlx::Error) -> Option<String> {
    let db_error = error.as_database_error()?;
    if db_error.code().as_deref() != Some(UNIQUE_VIOLATION) {
        return None;
    }
    Some(db_error.constraint().unwrap_or_default().to_string())
}

#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn search_candidates(&self, tokens: &[String], limit: usize) -> ReconcileResult<Vec<CatalogEntry>> {
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        queries::search_catalog(&self.pool, tokens, limit)
            .await?
            .into_iter()
            .map(CatalogEntry::try_from)
            .collect()
    }

    async fn get(&self, id: &str) -> ReconcileResult<Option<CatalogEntry>> {
        queries::get_catalog_entry(&self.pool, id)
            .await?
            .map(CatalogEntry::try_from)
            .transpose()
    }

    async fn create(&self, entry: &NewCatalogEntry) -> ReconcileResult<CatalogEntry> {
        match queries::insert_catalog_entry(&self.pool, entry).await {
            Ok(()) => Ok(entry.clone().into_entry()),
            Err(e) => match unique_constraint(&e).as_deref() {
                Some(CATALOG_NAME_INDEX) => {
                    tracing::debug!("catalog already has '{}', reusing it", entry.name);
                    queries::find_catalog_by_name(&self.pool, &entry.name)
                        .await?
                        .map(CatalogEntry::try_from)
                        .transpose()?
                        .ok_or_else(|| ReconcileError::Storage(format!(
                            "name conflict for '{}' but no row found",
                            entry.name
                        )))
                }
                Some(_) => Err(ReconcileError::DuplicateKey(entry.id.clone())),
                None => Err(e.into()),
            },
        }
    }
}

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn line_record(result: &MatchResult) -> ReconcileResult<LineResultRecord> {
    Ok(LineResultRecord {
        line_id: result.line_id,
        status: result.status.as_str().to_string(),
        stage: result.stage.map(|s| s.as_str().to_string()),
        confidence: result.confidence,
        catalog_sku: result.entry.as_ref().map(|e| e.id.clone()),
        payload: serde_json::to_string(result)?,
        matched_at: result.matched_at,
    })
}

#[async_trait]
impl ReconciliationRepository for PgRepository {
    async fn list_raw_lines(&self, invoice_id: i64) -> ReconcileResult<Vec<RawLine>> {
        Ok(queries::list_invoice_lines(&self.pool, invoice_id).await?)
    }

    async fn load(&self, invoice_id: i64) -> ReconcileResult<Option<InvoiceReconciliation>> {
        let Some(header) = queries::get_reconciliation_header(&self.pool, invoice_id).await? else {
            return Ok(None);
        };

        let raw_lines = queries::list_invoice_lines(&self.pool, invoice_id).await?;
        let mut results: HashMap<i64, MatchResult> = HashMap::new();
        for row in queries::list_line_results(&self.pool, invoice_id).await? {
            results.insert(row.line_id, serde_json::from_str(&row.payload)?);
        }

        let mut reconciliation = InvoiceReconciliation::new(invoice_id, raw_lines);
        for line in reconciliation.lines.iter_mut() {
            if let Some(result) = results.remove(&line.raw.line_id) {
                line.result = result;
            }
        }
        reconciliation.status = header.status.parse()?;
        reconciliation.receipt_id = header.receipt_id.map(GoodsReceiptId);
        reconciliation.confirmed_at = header.confirmed_at;
        reconciliation.updated_at = header.updated_at;
        Ok(Some(reconciliation))
    }

    async fn save(&self, reconciliation: &InvoiceReconciliation) -> ReconcileResult<()> {
        let records = reconciliation
            .lines
            .iter()
            .map(|l| line_record(&l.result))
            .collect::<ReconcileResult<Vec<_>>>()?;
        let header = ReconciliationHeaderRow {
            invoice_id: reconciliation.invoice_id,
            status: reconciliation.status.as_str().to_string(),
            receipt_id: reconciliation.receipt_id.as_ref().map(|r| r.0.clone()),
            confirmed_at: reconciliation.confirmed_at,
            updated_at: reconciliation.updated_at,
        };

        let mut tx = self.pool.begin().await?;
        queries::upsert_reconciliation_header(&mut tx, &header).await?;
        queries::upsert_line_results(&mut tx, reconciliation.invoice_id, &records).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_invoice_for_line(&self, line_id: i64) -> ReconcileResult<Option<i64>> {
        Ok(queries::find_invoice_for_line(&self.pool, line_id).await?)
    }
}

#[derive(Clone)]
pub struct PgInventory {
    pool: PgPool,
}

impl PgInventory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InventoryGateway for PgInventory {
    /// 单事务写入入库单头与明细；同一发票重复提交返回首次的入库单号
    async fn commit_receipt(&self, receipt: &GoodsReceipt) -> ReconcileResult<GoodsReceiptId> {
        let failure = |e: sqlx::Error| ReconcileError::ReceiptCommitFailure(e.to_string());

        let mut tx = self.pool.begin().await.map_err(failure)?;
        if let Some(existing) = queries::find_receipt_id(&mut tx, receipt.invoice_id)
            .await
            .map_err(failure)?
        {
            tracing::info!("发票 {} 已存在入库单 {}", receipt.invoice_id, existing);
            return Ok(GoodsReceiptId(existing));
        }

        let receipt_id = format!("GRN-{}-{}", receipt.invoice_id, Utc::now().timestamp_millis());
        queries::insert_goods_receipt(&mut tx, &receipt_id, receipt)
            .await
            .map_err(failure)?;
        tx.commit().await.map_err(failure)?;

        tracing::info!(
            "✓ 入库单 {} 写入成功, {} 行, 总数量 {}",
            receipt_id,
            receipt.lines.len(),
            receipt.total_quantity()
        );
        Ok(GoodsReceiptId(receipt_id))
    }
}
