use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::time::Duration;

use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{CatalogEntry, GoodsReceipt, NewCatalogEntry, RawLine};

/// 批量写入超时
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// catalog_product 行
#[derive(Debug, Clone, FromRow)]
pub struct CatalogRow {
    pub sku: String,
    pub name: String,
    pub category: String,
    pub potency: String,
    pub form: String,
    pub brand: String,
    pub hsn_code: String,
}

impl TryFrom<CatalogRow> for CatalogEntry {
    type Error = ReconcileError;

    fn try_from(row: CatalogRow) -> ReconcileResult<Self> {
        Ok(CatalogEntry {
            id: row.sku,
            name: row.name,
            category: row.category.parse()?,
            potency: crate::models::Potency::new(row.potency),
            form: row.form.parse()?,
            brand: row.brand,
            hsn_code: row.hsn_code,
        })
    }
}

/// reconciliation_invoice 行
#[derive(Debug, Clone, FromRow)]
pub struct ReconciliationHeaderRow {
    pub invoice_id: i64,
    pub status: String,
    pub receipt_id: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// reconciliation_line 行，结果以 JSON 存储
#[derive(Debug, Clone, FromRow)]
pub struct LineResultRow {
    pub line_id: i64,
    pub payload: String,
}

/// 持久化时展开的行结果
#[derive(Debug, Clone)]
pub struct LineResultRecord {
    pub line_id: i64,
    pub status: String,
    pub stage: Option<String>,
    pub confidence: f64,
    pub catalog_sku: Option<String>,
    pub payload: String,
    pub matched_at: DateTime<Utc>,
}

const CATALOG_COLUMNS: &str = "sku, name, category, potency, form, brand, hsn_code";

/// 查询发票原始行
pub async fn list_invoice_lines(pool: &PgPool, invoice_id: i64) -> Result<Vec<RawLine>, sqlx::Error> {
    sqlx::query_as::<_, RawLine>(
        r#"
        SELECT line_id, invoice_id, line_number, description, brand,
               quantity, unit_price, line_total, batch_no, expiry
        FROM invoice_line
        WHERE invoice_id = $1
        ORDER BY line_number, line_id
        "#
    )
    .bind(invoice_id)
    .fetch_all(pool)
    .await
}

pub async fn find_invoice_for_line(pool: &PgPool, line_id: i64) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT invoice_id FROM invoice_line WHERE line_id = $1")
        .bind(line_id)
        .fetch_optional(pool)
        .await
}

/// LIKE 模式转义
fn like_pattern(token: &str) -> String {
    let escaped = token
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// 候选检索: 名称包含任一关键词 (按建档顺序)
pub async fn search_catalog(
    pool: &PgPool,
    tokens: &[String],
    limit: usize,
) -> Result<Vec<CatalogRow>, sqlx::Error> {
    let patterns: Vec<String> = tokens.iter().map(|t| like_pattern(t)).collect();
    sqlx::query_as::<_, CatalogRow>(&format!(
        r#"
        SELECT {CATALOG_COLUMNS}
        FROM catalog_product
        WHERE lower(name) LIKE ANY($1)
        ORDER BY created_at, sku
        LIMIT $2
        "#
    ))
    .bind(patterns)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
}

pub async fn get_catalog_entry(pool: &PgPool, sku: &str) -> Result<Option<CatalogRow>, sqlx::Error> {
    sqlx::query_as::<_, CatalogRow>(&format!(
        "SELECT {CATALOG_COLUMNS} FROM catalog_product WHERE sku = $1"
    ))
    .bind(sku)
    .fetch_optional(pool)
    .await
}

pub async fn find_catalog_by_name(pool: &PgPool, name: &str) -> Result<Option<CatalogRow>, sqlx::Error> {
    sqlx::query_as::<_, CatalogRow>(&format!(
        "SELECT {CATALOG_COLUMNS} FROM catalog_product WHERE lower(name) = lower($1)"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await
}

pub async fn insert_catalog_entry(pool: &PgPool, entry: &NewCatalogEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO catalog_product (sku, name, category, potency, form, brand, hsn_code, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, now())
        "#
    )
    .bind(&entry.id)
    .bind(&entry.name)
    .bind(entry.category.as_str())
    .bind(entry.potency.as_str())
    .bind(entry.form.as_str())
    .bind(&entry.brand)
    .bind(entry.tax_class.hsn_code())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_reconciliation_header(
    pool: &PgPool,
    invoice_id: i64,
) -> Result<Option<ReconciliationHeaderRow>, sqlx::Error> {
    sqlx::query_as::<_, ReconciliationHeaderRow>(
        r#"
        SELECT invoice_id, status, receipt_id, confirmed_at, updated_at
        FROM reconciliation_invoice
        WHERE invoice_id = $1
        "#
    )
    .bind(invoice_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_line_results(pool: &PgPool, invoice_id: i64) -> Result<Vec<LineResultRow>, sqlx::Error> {
    sqlx::query_as::<_, LineResultRow>(
        "SELECT line_id, payload FROM reconciliation_line WHERE invoice_id = $1"
    )
    .bind(invoice_id)
    .fetch_all(pool)
    .await
}

pub async fn upsert_reconciliation_header(
    tx: &mut Transaction<'_, Postgres>,
    header: &ReconciliationHeaderRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO reconciliation_invoice (invoice_id, status, receipt_id, confirmed_at, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (invoice_id) DO UPDATE
        SET status = EXCLUDED.status,
            receipt_id = EXCLUDED.receipt_id,
            confirmed_at = EXCLUDED.confirmed_at,
            updated_at = EXCLUDED.updated_at
        "#
    )
    .bind(header.invoice_id)
    .bind(&header.status)
    .bind(&header.receipt_id)
    .bind(header.confirmed_at)
    .bind(header.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// 批量写入行结果
pub async fn upsert_line_results(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: i64,
    records: &[LineResultRecord],
) -> Result<(), sqlx::Error> {
    if records.is_empty() {
        return Ok(());
    }

    let mut query_builder = sqlx::QueryBuilder::new(
        "INSERT INTO reconciliation_line (
            line_id, invoice_id, status, stage, confidence, catalog_sku, payload, matched_at
        ) "
    );
    query_builder.push_values(records, |mut b, r| {
        b.push_bind(r.line_id)
            .push_bind(invoice_id)
            .push_bind(&r.status)
            .push_bind(&r.stage)
            .push_bind(r.confidence)
            .push_bind(&r.catalog_sku)
            .push_bind(&r.payload)
            .push_bind(r.matched_at);
    });
    query_builder.push(
        " ON CONFLICT (line_id) DO UPDATE
          SET status = EXCLUDED.status,
              stage = EXCLUDED.stage,
              confidence = EXCLUDED.confidence,
              catalog_sku = EXCLUDED.catalog_sku,
              payload = EXCLUDED.payload,
              matched_at = EXCLUDED.matched_at",
    );

    let start = std::time::Instant::now();
    match tokio::time::timeout(WRITE_TIMEOUT, query_builder.build().execute(&mut **tx)).await {
        Ok(Ok(result)) => {
            tracing::debug!("写入 {} 条行结果, 耗时: {:?}", result.rows_affected(), start.elapsed());
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!("✗ 行结果写入失败, 耗时: {:?}, 错误: {:?}", start.elapsed(), e);
            Err(e)
        }
        Err(_) => {
            tracing::error!("✗ 行结果写入超时 (>{:?})!", WRITE_TIMEOUT);
            Err(sqlx::Error::PoolTimedOut)
        }
    }
}

pub async fn find_receipt_id(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: i64,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT receipt_id FROM goods_receipt WHERE invoice_id = $1")
        .bind(invoice_id)
        .fetch_optional(&mut **tx)
        .await
}

/// 写入入库单头与全部明细 (调用方负责事务)
pub async fn insert_goods_receipt(
    tx: &mut Transaction<'_, Postgres>,
    receipt_id: &str,
    receipt: &GoodsReceipt,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO goods_receipt (receipt_id, invoice_id, total_quantity, created_at)
        VALUES ($1, $2, $3, $4)
        "#
    )
    .bind(receipt_id)
    .bind(receipt.invoice_id)
    .bind(receipt.total_quantity())
    .bind(receipt.created_at)
    .execute(&mut **tx)
    .await?;

    if receipt.lines.is_empty() {
        return Ok(());
    }

    let mut query_builder = sqlx::QueryBuilder::new(
        "INSERT INTO goods_receipt_line (
            receipt_id, line_id, sku, quantity, unit_price, batch_no, expiry
        ) "
    );
    query_builder.push_values(&receipt.lines, |mut b, line| {
        b.push_bind(receipt_id)
            .push_bind(line.line.line_id)
            .push_bind(&line.entry.id)
            .push_bind(line.quantity.clone())
            .push_bind(line.unit_price.clone())
            .push_bind(&line.line.batch_no)
            .push_bind(&line.line.expiry);
    });

    match tokio::time::timeout(WRITE_TIMEOUT, query_builder.build().execute(&mut **tx)).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => {
            tracing::error!("✗ 入库明细写入超时 (>{:?})!", WRITE_TIMEOUT);
            Err(sqlx::Error::PoolTimedOut)
        }
    }
}
