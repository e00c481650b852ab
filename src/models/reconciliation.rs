use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::catalog::CatalogEntry;
use super::line::RawLine;
use super::result::{LineStatus, MatchResult};
use crate::error::ReconcileError;

/// 发票级状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    InProgress,
    /// 终态
    Confirmed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::InProgress => "in_progress",
            InvoiceStatus::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(InvoiceStatus::InProgress),
            "confirmed" => Ok(InvoiceStatus::Confirmed),
            other => Err(ReconcileError::Storage(format!("unknown invoice status '{}'", other))),
        }
    }
}

/// 原始行 + 当前匹配结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledLine {
    pub raw: RawLine,
    pub result: MatchResult,
}

/// 行状态计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationCounts {
    pub total: usize,
    pub matched: usize,
    pub needs_review: usize,
    pub unmatched: usize,
}

impl ReconciliationCounts {
    pub fn unresolved(&self) -> usize {
        self.needs_review + self.unmatched
    }
}

/// 单张发票的对账状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceReconciliation {
    pub invoice_id: i64,
    pub status: InvoiceStatus,
    /// 按行号排序
    pub lines: Vec<ReconciledLine>,
    pub receipt_id: Option<GoodsReceiptId>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl InvoiceReconciliation {
    /// 从原始行构建，所有行初始为 unmatched
    pub fn new(invoice_id: i64, mut raw_lines: Vec<RawLine>) -> Self {
        raw_lines.sort_by_key(|l| (l.line_number, l.line_id));
        let lines = raw_lines
            .into_iter()
            .map(|raw| ReconciledLine {
                result: MatchResult::pending(raw.line_id),
                raw,
            })
            .collect();

        Self {
            invoice_id,
            status: InvoiceStatus::InProgress,
            lines,
            receipt_id: None,
            confirmed_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == InvoiceStatus::Confirmed
    }

    pub fn line(&self, line_id: i64) -> Option<&ReconciledLine> {
        self.lines.iter().find(|l| l.raw.line_id == line_id)
    }

    pub fn line_mut(&mut self, line_id: i64) -> Option<&mut ReconciledLine> {
        self.lines.iter_mut().find(|l| l.raw.line_id == line_id)
    }

    pub fn results(&self) -> Vec<MatchResult> {
        self.lines.iter().map(|l| l.result.clone()).collect()
    }

    /// 汇总计数
    pub fn counts(&self) -> ReconciliationCounts {
        let mut counts = ReconciliationCounts {
            total: self.lines.len(),
            ..Default::default()
        };
        for line in &self.lines {
            match line.result.status {
                LineStatus::Matched => counts.matched += 1,
                LineStatus::NeedsReview => counts.needs_review += 1,
                LineStatus::Unmatched => counts.unmatched += 1,
            }
        }
        counts
    }
}

/// 入库单编号
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoodsReceiptId(pub String);

impl fmt::Display for GoodsReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 入库明细: 原始行 + 选定目录条目 + 数量/价格
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub line: RawLine,
    pub entry: CatalogEntry,
    pub quantity: BigDecimal,
    pub unit_price: Option<BigDecimal>,
}

/// 确认时一次性发出的入库事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodsReceipt {
    pub invoice_id: i64,
    pub lines: Vec<ReceiptLine>,
    pub created_at: DateTime<Utc>,
}

impl GoodsReceipt {
    pub fn total_quantity(&self) -> BigDecimal {
        self.lines
            .iter()
            .fold(BigDecimal::zero(), |acc, l| acc + &l.quantity)
    }
}

/// 批量自动匹配统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoMatchSummary {
    pub invoice_id: i64,
    pub evaluated: usize,
    pub matched_count: usize,
    pub needs_review: usize,
    pub still_unmatched: usize,
}

/// 确认前校验报告 (不修改状态)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub invoice_id: i64,
    pub can_confirm: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub counts: ReconciliationCounts,
    pub calculated_total: BigDecimal,
}
