use bigdecimal::BigDecimal;
use csv::Writer;

use crate::error::{ReconcileError, ReconcileResult};
use crate::models::InvoiceReconciliation;

const HEADER: [&str; 14] = [
    "line_id",
    "line_number",
    "description",
    "clean_name",
    "category",
    "potency",
    "brand",
    "stage",
    "confidence",
    "status",
    "catalog_id",
    "quantity",
    "unit_price",
    "diagnostic",
];

/// 将 Option<BigDecimal> 转换为 CSV 字符串
fn option_to_csv(val: &Option<BigDecimal>) -> String {
    val.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

/// 导出对账审计明细 (每行一条记录)
pub fn audit_csv(reconciliation: &InvoiceReconciliation) -> ReconcileResult<Vec<u8>> {
    let mut writer = Writer::from_writer(Vec::new());
    writer.write_record(HEADER).map_err(csv_error)?;

    for line in &reconciliation.lines {
        let attrs = line.result.attributes.as_ref();
        writer
            .write_record([
                line.raw.line_id.to_string(),
                line.raw.line_number.to_string(),
                line.raw.description.clone(),
                attrs.map(|a| a.clean_name.clone()).unwrap_or_default(),
                attrs.map(|a| a.category.to_string()).unwrap_or_default(),
                attrs.map(|a| a.potency.to_string()).unwrap_or_default(),
                attrs.map(|a| a.brand.clone()).unwrap_or_default(),
                line.result.stage.map(|s| s.to_string()).unwrap_or_default(),
                format!("{:.2}", line.result.confidence),
                line.result.status.to_string(),
                line.result.entry.as_ref().map(|e| e.id.clone()).unwrap_or_default(),
                option_to_csv(&line.raw.quantity),
                option_to_csv(&line.raw.unit_price),
                line.result.diagnostic.clone().unwrap_or_default(),
            ])
            .map_err(csv_error)?;
    }

    writer
        .into_inner()
        .map_err(|e| ReconcileError::Storage(format!("csv export: {}", e)))
}

fn csv_error(e: csv::Error) -> ReconcileError {
    ReconcileError::Storage(format!("csv export: {}", e))
}
