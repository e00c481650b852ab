//! 对账状态机
//!
//! 行状态: unmatched -> needs_review -> matched (由置信度阈值驱动) + 人工指定。
//! 发票状态: in_progress -> confirmed (终态)。所有写入都经过这里校验。

use chrono::Utc;

use super::auto_create::AUTO_CREATE_CONFIDENCE;
use super::matcher::{CascadeOutcome, StageHit};
use crate::config::MatchingConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{
    AutoMatchSummary, CatalogEntry, GoodsReceipt, GoodsReceiptId, InvoiceReconciliation,
    InvoiceStatus, LineStatus, MatchResult, MatchStage, ProductAttributes, ReceiptLine,
};

pub const MANUAL_CONFIDENCE: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct ReconciliationStateMachine {
    review_threshold: f64,
    matched_threshold: f64,
    auto_commit_threshold: f64,
}

impl ReconciliationStateMachine {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            review_threshold: config.review_threshold,
            matched_threshold: config.matched_threshold,
            auto_commit_threshold: config.auto_commit_threshold,
        }
    }

    pub fn status_for(&self, confidence: f64) -> LineStatus {
        if confidence >= self.matched_threshold {
            LineStatus::Matched
        } else if confidence >= self.review_threshold {
            LineStatus::NeedsReview
        } else {
            LineStatus::Unmatched
        }
    }

    /// 由命中构建结果；低于复核阈值的候选不保留
    pub fn resolved(&self, line_id: i64, attributes: ProductAttributes, hit: StageHit) -> MatchResult {
        let status = self.status_for(hit.confidence);
        if status == LineStatus::Unmatched {
            return MatchResult::unresolved(
                line_id,
                Some(attributes),
                format!(
                    "best candidate {} at {:.2} is below the review threshold",
                    hit.entry.id, hit.confidence
                ),
            );
        }

        MatchResult {
            line_id,
            attributes: Some(attributes),
            entry: Some(hit.entry),
            stage: Some(hit.stage),
            confidence: hit.confidence,
            status,
            diagnostic: None,
            matched_at: Utc::now(),
        }
    }

    /// 自动建档的结果
    pub fn auto_created(&self, line_id: i64, attributes: ProductAttributes, entry: CatalogEntry) -> MatchResult {
        self.resolved(
            line_id,
            attributes,
            StageHit::new(entry, MatchStage::AutoCreated, AUTO_CREATE_CONFIDENCE),
        )
    }

    /// 批量模式可直接提交的命中: 阶段 1-3，或相似度超过自动提交门槛
    pub fn is_auto_committable(&self, hit: &StageHit) -> bool {
        let eligible = match hit.stage {
            MatchStage::Exact | MatchStage::Normalized | MatchStage::AttributeFuzzy => true,
            MatchStage::FuzzySimilarity => hit.score > self.auto_commit_threshold,
            MatchStage::SemanticFallback | MatchStage::AutoCreated | MatchStage::Manual => false,
        };
        eligible && self.status_for(hit.confidence) == LineStatus::Matched
    }

    /// 批量模式下单行的结论；None 表示保持 unmatched
    pub fn bulk_verdict(
        &self,
        line_id: i64,
        attributes: ProductAttributes,
        outcome: CascadeOutcome,
    ) -> Option<MatchResult> {
        if let Some(hit) = outcome.hit.as_ref().filter(|h| self.is_auto_committable(h)) {
            return Some(self.resolved(line_id, attributes, hit.clone()));
        }

        // 未能提交的最佳候选进入人工复核
        let review = outcome
            .hit
            .into_iter()
            .chain(outcome.suggestion)
            .filter(|h| h.confidence >= self.review_threshold)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))?;

        let mut result = self.resolved(line_id, attributes, review);
        result.status = LineStatus::NeedsReview;
        Some(result)
    }

    /// 写入批量结果，只覆盖仍为 unmatched 的行
    ///
    /// `evaluated` 只统计实际写入的结论行，`still_unmatched` 为写入后的整单计数。
    pub fn apply_bulk(
        &self,
        reconciliation: &mut InvoiceReconciliation,
        verdicts: Vec<MatchResult>,
    ) -> ReconcileResult<AutoMatchSummary> {
        self.ensure_open(reconciliation)?;

        let mut summary = AutoMatchSummary {
            invoice_id: reconciliation.invoice_id,
            ..Default::default()
        };
        for result in verdicts {
            let Some(line) = reconciliation.line_mut(result.line_id) else {
                continue;
            };
            if line.result.status != LineStatus::Unmatched {
                continue;
            }
            summary.evaluated += 1;
            match result.status {
                LineStatus::Matched => summary.matched_count += 1,
                LineStatus::NeedsReview => summary.needs_review += 1,
                LineStatus::Unmatched => {}
            }
            line.result = result;
        }
        summary.still_unmatched = reconciliation.counts().unmatched;
        reconciliation.updated_at = Utc::now();
        Ok(summary)
    }

    /// 写入交互式解析结果，已 matched 的行保持不变
    pub fn apply_evaluated(
        &self,
        reconciliation: &mut InvoiceReconciliation,
        results: Vec<MatchResult>,
    ) -> ReconcileResult<()> {
        self.ensure_open(reconciliation)?;

        for result in results {
            if let Some(line) = reconciliation.line_mut(result.line_id) {
                if !line.result.is_matched() {
                    line.result = result;
                }
            }
        }
        reconciliation.updated_at = Utc::now();
        Ok(())
    }

    /// 人工指定候选: 置信度 1.0，阶段 manual
    pub fn override_line(
        &self,
        reconciliation: &mut InvoiceReconciliation,
        line_id: i64,
        entry: CatalogEntry,
    ) -> ReconcileResult<MatchResult> {
        self.ensure_open(reconciliation)?;

        let line = reconciliation
            .line_mut(line_id)
            .ok_or(ReconcileError::LineNotFound(line_id))?;

        line.result = MatchResult {
            line_id,
            attributes: line.result.attributes.take(),
            entry: Some(entry),
            stage: Some(MatchStage::Manual),
            confidence: MANUAL_CONFIDENCE,
            status: LineStatus::Matched,
            diagnostic: None,
            matched_at: Utc::now(),
        };
        let result = line.result.clone();
        reconciliation.updated_at = Utc::now();
        Ok(result)
    }

    /// 确认前置条件检查，并构建入库事件
    pub fn receipt(&self, reconciliation: &InvoiceReconciliation) -> ReconcileResult<GoodsReceipt> {
        self.ensure_open(reconciliation)?;

        if reconciliation.lines.is_empty() {
            return Err(ReconcileError::EmptyInvoice(reconciliation.invoice_id));
        }

        let unresolved = reconciliation.counts().unresolved();
        if unresolved > 0 {
            return Err(ReconcileError::ConfirmPrecondition {
                invoice_id: reconciliation.invoice_id,
                unresolved,
            });
        }

        let lines = reconciliation
            .lines
            .iter()
            .map(|line| {
                let entry = line.result.entry.clone().ok_or(ReconcileError::ConfirmPrecondition {
                    invoice_id: reconciliation.invoice_id,
                    unresolved: 1,
                })?;
                let quantity = line
                    .raw
                    .quantity
                    .clone()
                    .ok_or_else(|| line.raw.malformed("missing quantity"))?;
                Ok::<_, ReconcileError>(ReceiptLine {
                    line: line.raw.clone(),
                    entry,
                    quantity,
                    unit_price: line.raw.unit_price.clone(),
                })
            })
            .collect::<ReconcileResult<Vec<_>>>()?;

        Ok(GoodsReceipt {
            invoice_id: reconciliation.invoice_id,
            lines,
            created_at: Utc::now(),
        })
    }

    /// 入库成功后进入终态
    pub fn mark_confirmed(&self, reconciliation: &mut InvoiceReconciliation, receipt_id: GoodsReceiptId) {
        let now = Utc::now();
        reconciliation.status = InvoiceStatus::Confirmed;
        reconciliation.receipt_id = Some(receipt_id);
        reconciliation.confirmed_at = Some(now);
        reconciliation.updated_at = now;
    }

    fn ensure_open(&self, reconciliation: &InvoiceReconciliation) -> ReconcileResult<()> {
        if reconciliation.is_confirmed() {
            return Err(ReconcileError::AlreadyConfirmed(reconciliation.invoice_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, DosageForm, Potency, RawLine};
    use bigdecimal::BigDecimal;

    fn machine() -> ReconciliationStateMachine {
        ReconciliationStateMachine::new(&MatchingConfig::default())
    }

    fn entry(id: &str) -> CatalogEntry {
        CatalogEntry {
            id: id.to_string(),
            name: format!("Product {}", id),
            category: Category::Dilution,
            potency: Potency::new("30C"),
            form: DosageForm::Dilution,
            brand: "SBL".to_string(),
            hsn_code: "30049014".to_string(),
        }
    }

    fn attrs() -> ProductAttributes {
        ProductAttributes {
            clean_name: "Arnica Montana 30C".to_string(),
            category: Category::Dilution,
            potency: Potency::new("30C"),
            form: DosageForm::Dilution,
            brand: "SBL".to_string(),
            confidence: 0.95,
            rule: "dilution-potency".to_string(),
        }
    }

    fn hit(stage: MatchStage, confidence: f64) -> StageHit {
        StageHit::new(entry("E1"), stage, confidence)
    }

    fn raw(line_id: i64) -> RawLine {
        RawLine {
            line_id,
            invoice_id: 1,
            line_number: line_id as i32,
            description: "Arnica Montana 30C".to_string(),
            brand: None,
            quantity: Some(BigDecimal::from(2)),
            unit_price: Some(BigDecimal::from(90)),
            line_total: Some(BigDecimal::from(180)),
            batch_no: Some("B-17".to_string()),
            expiry: Some("2028-03".to_string()),
        }
    }

    fn invoice(lines: usize) -> InvoiceReconciliation {
        InvoiceReconciliation::new(1, (1..=lines as i64).map(raw).collect())
    }

    #[test]
    fn test_status_thresholds() {
        let m = machine();
        assert_eq!(m.status_for(1.0), LineStatus::Matched);
        assert_eq!(m.status_for(0.85), LineStatus::Matched);
        assert_eq!(m.status_for(0.80), LineStatus::NeedsReview);
        assert_eq!(m.status_for(0.60), LineStatus::NeedsReview);
        assert_eq!(m.status_for(0.59), LineStatus::Unmatched);
    }

    #[test]
    fn test_low_confidence_hit_drops_entry() {
        let result = machine().resolved(1, attrs(), hit(MatchStage::FuzzySimilarity, 0.40));
        assert_eq!(result.status, LineStatus::Unmatched);
        assert!(result.entry.is_none());
        assert!(result.diagnostic.is_some());
    }

    #[test]
    fn test_bulk_commit_policy() {
        let m = machine();
        let outcome = |hit: Option<StageHit>, suggestion: Option<StageHit>| CascadeOutcome {
            hit,
            suggestion,
            recovered: None,
        };

        let exact = m
            .bulk_verdict(1, attrs(), outcome(Some(hit(MatchStage::Exact, 1.0)), None))
            .unwrap();
        assert_eq!(exact.status, LineStatus::Matched);

        // 0.88 通过接受阈值但未超过自动提交门槛
        let fuzzy = m
            .bulk_verdict(1, attrs(), outcome(Some(hit(MatchStage::FuzzySimilarity, 0.88)), None))
            .unwrap();
        assert_eq!(fuzzy.status, LineStatus::NeedsReview);
        assert_eq!(fuzzy.entry.unwrap().id, "E1");

        let strong = m
            .bulk_verdict(1, attrs(), outcome(Some(hit(MatchStage::FuzzySimilarity, 0.93)), None))
            .unwrap();
        assert_eq!(strong.status, LineStatus::Matched);

        let semantic = m
            .bulk_verdict(1, attrs(), outcome(Some(hit(MatchStage::SemanticFallback, 0.80)), None))
            .unwrap();
        assert_eq!(semantic.status, LineStatus::NeedsReview);

        let suggested = m
            .bulk_verdict(1, attrs(), outcome(None, Some(hit(MatchStage::FuzzySimilarity, 0.80))))
            .unwrap();
        assert_eq!(suggested.status, LineStatus::NeedsReview);
        assert_eq!(suggested.confidence, 0.80);

        assert!(m
            .bulk_verdict(1, attrs(), outcome(None, Some(hit(MatchStage::FuzzySimilarity, 0.41))))
            .is_none());
        assert!(m.bulk_verdict(1, attrs(), CascadeOutcome::default()).is_none());
    }

    #[test]
    fn test_auto_commit_compares_unrounded_similarity() {
        let m = machine();
        let just_above = StageHit {
            score: 0.9048,
            ..hit(MatchStage::FuzzySimilarity, 0.90)
        };
        assert!(m.is_auto_committable(&just_above));

        let at_threshold = StageHit {
            score: 0.90,
            ..hit(MatchStage::FuzzySimilarity, 0.90)
        };
        assert!(!m.is_auto_committable(&at_threshold));
    }

    #[test]
    fn test_apply_bulk_only_touches_unmatched_lines() {
        let m = machine();
        let mut rec = invoice(2);
        m.override_line(&mut rec, 1, entry("manual")).unwrap();

        let verdicts = vec![
            m.resolved(1, attrs(), hit(MatchStage::Exact, 1.0)),
            m.resolved(2, attrs(), hit(MatchStage::Exact, 1.0)),
        ];
        let summary = m.apply_bulk(&mut rec, verdicts).unwrap();
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.matched_count, 1);
        assert_eq!(summary.still_unmatched, 0);
        assert_eq!(rec.line(1).unwrap().result.stage, Some(MatchStage::Manual));
        assert_eq!(rec.line(2).unwrap().result.stage, Some(MatchStage::Exact));
    }

    #[test]
    fn test_override_sets_manual_full_confidence() {
        let m = machine();
        let mut rec = invoice(1);
        let result = m.override_line(&mut rec, 1, entry("E9")).unwrap();
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.stage, Some(MatchStage::Manual));
        assert_eq!(result.status, LineStatus::Matched);
        assert_eq!(
            m.override_line(&mut rec, 42, entry("E9")),
            Err(ReconcileError::LineNotFound(42))
        );
    }

    #[test]
    fn test_confirm_precondition_counts_unresolved() {
        let m = machine();
        let mut rec = invoice(3);
        m.override_line(&mut rec, 1, entry("A")).unwrap();
        m.override_line(&mut rec, 2, entry("B")).unwrap();
        rec.line_mut(3).unwrap().result =
            m.resolved(3, attrs(), hit(MatchStage::SemanticFallback, 0.80));

        assert_eq!(
            m.receipt(&rec),
            Err(ReconcileError::ConfirmPrecondition {
                invoice_id: 1,
                unresolved: 1
            })
        );
        assert!(!rec.is_confirmed());
    }

    #[test]
    fn test_receipt_carries_all_lines_and_confirm_is_terminal() {
        let m = machine();
        let mut rec = invoice(2);
        m.override_line(&mut rec, 1, entry("A")).unwrap();
        m.override_line(&mut rec, 2, entry("B")).unwrap();

        let receipt = m.receipt(&rec).unwrap();
        assert_eq!(receipt.lines.len(), 2);
        assert_eq!(receipt.total_quantity(), BigDecimal::from(4));
        assert_eq!(receipt.lines[0].line.batch_no.as_deref(), Some("B-17"));

        m.mark_confirmed(&mut rec, GoodsReceiptId("GR-1".to_string()));
        assert_eq!(rec.status, InvoiceStatus::Confirmed);
        assert_eq!(m.receipt(&rec), Err(ReconcileError::AlreadyConfirmed(1)));
        assert_eq!(
            m.override_line(&mut rec, 1, entry("C")),
            Err(ReconcileError::AlreadyConfirmed(1))
        );
    }

    #[test]
    fn test_empty_invoice_cannot_confirm() {
        let rec = InvoiceReconciliation::new(7, Vec::new());
        assert_eq!(machine().receipt(&rec), Err(ReconcileError::EmptyInvoice(7)));
    }
}
