pub mod catalog;
pub mod line;
pub mod reconciliation;
pub mod result;

pub use catalog::{CatalogEntry, NewCatalogEntry, TaxClass};
pub use line::{Category, DosageForm, Potency, ProductAttributes, RawLine, UNBRANDED};
pub use reconciliation::{
    AutoMatchSummary, GoodsReceipt, GoodsReceiptId, InvoiceReconciliation, InvoiceStatus,
    ReceiptLine, ReconciledLine, ReconciliationCounts, ValidationReport,
};
pub use result::{LineStatus, MatchResult, MatchStage};
