//! 发票对账服务
//!
//! 对外操作: 解析匹配、人工指定、批量自动匹配、确认入库、校验、导出。
//! 逐行评估在锁外并行执行，写入时在发票级单写锁内重新加载并经状态机校验。

use bigdecimal::{BigDecimal, Zero};
use dashmap::DashMap;
use futures::future::join_all;
use indexmap::IndexSet;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use super::auto_create::{AutoCreateCache, CatalogAutoCreator, SkuGenerator};
use super::classifier::{AttributeClassifier, ClassifierInput};
use super::export;
use super::matcher::{similarity, MatchEngine};
use super::normalizer::TextNormalizer;
use super::state_machine::ReconciliationStateMachine;
use crate::config::{AppConfig, SemanticConfig};
use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{
    AutoMatchSummary, CatalogEntry, GoodsReceiptId, InvoiceReconciliation, LineStatus,
    MatchResult, ProductAttributes, RawLine, ValidationReport,
};
use crate::semantic::SemanticMatcher;
use crate::store::{CatalogStore, InventoryGateway, ReconciliationRepository};

/// 允许的金额舍入误差
const TOTAL_TOLERANCE: i64 = 1;

pub struct ReconciliationService {
    catalog: Arc<dyn CatalogStore>,
    repository: Arc<dyn ReconciliationRepository>,
    inventory: Arc<dyn InventoryGateway>,
    normalizer: TextNormalizer,
    classifier: AttributeClassifier,
    engine: MatchEngine,
    creator: CatalogAutoCreator,
    machine: ReconciliationStateMachine,
    candidate_limit: usize,
    /// 发票级单写锁
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl ReconciliationService {
    pub fn new(
        config: &AppConfig,
        catalog: Arc<dyn CatalogStore>,
        repository: Arc<dyn ReconciliationRepository>,
        inventory: Arc<dyn InventoryGateway>,
    ) -> Self {
        Self {
            creator: CatalogAutoCreator::new(catalog.clone()),
            catalog,
            repository,
            inventory,
            normalizer: TextNormalizer::new(),
            classifier: AttributeClassifier::new(&config.brands),
            engine: MatchEngine::new(&config.matching),
            machine: ReconciliationStateMachine::new(&config.matching),
            candidate_limit: config.matching.candidate_limit,
            locks: DashMap::new(),
        }
    }

    /// 注入语义匹配兜底
    pub fn with_semantic(mut self, matcher: Arc<dyn SemanticMatcher>, config: &SemanticConfig) -> Self {
        self.engine = self.engine.with_semantic(matcher, config);
        self
    }

    pub fn with_sku_generator(mut self, skus: Box<dyn SkuGenerator>) -> Self {
        self.creator = CatalogAutoCreator::with_generator(self.catalog.clone(), skus);
        self
    }

    fn lock_for(&self, invoice_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(invoice_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 读取已有对账状态，尚未开始时由原始行构建 (不落库)
    async fn load_or_start(&self, invoice_id: i64) -> ReconcileResult<InvoiceReconciliation> {
        if let Some(existing) = self.repository.load(invoice_id).await? {
            return Ok(existing);
        }
        let raw_lines = self.repository.list_raw_lines(invoice_id).await?;
        if raw_lines.is_empty() {
            return Err(ReconcileError::InvoiceNotFound(invoice_id));
        }
        Ok(InvoiceReconciliation::new(invoice_id, raw_lines))
    }

    /// 校验 + 清洗 + 分类 (纯计算)
    fn prepare(&self, raw: &RawLine) -> ReconcileResult<ProductAttributes> {
        raw.validate()?;
        let clean_name = self.normalizer.normalize(&raw.description);
        if clean_name.is_empty() {
            return Err(raw.malformed("description is empty after normalization"));
        }
        Ok(self.classifier.classify(ClassifierInput {
            clean_name: &clean_name,
            raw_description: &raw.description,
            brand_field: raw.brand.as_deref(),
        }))
    }

    fn prepare_all(&self, lines: &[RawLine]) -> Vec<(i64, ReconcileResult<ProductAttributes>)> {
        lines
            .par_iter()
            .map(|raw| (raw.line_id, self.prepare(raw)))
            .collect()
    }

    /// 候选检索: 名称小写分词，保序去重
    async fn candidates(&self, attrs: &ProductAttributes) -> Vec<CatalogEntry> {
        let tokens = search_tokens(&attrs.clean_name);
        match self.catalog.search_candidates(&tokens, self.candidate_limit).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("candidate search failed for '{}': {}", attrs.clean_name, e);
                Vec::new()
            }
        }
    }

    /// 交互模式: 级联 -> 自动建档
    async fn evaluate_line(
        &self,
        line_id: i64,
        prepared: ReconcileResult<ProductAttributes>,
        cache: &AutoCreateCache,
    ) -> MatchResult {
        let attrs = match prepared {
            Ok(attrs) => attrs,
            Err(e) => {
                tracing::warn!("跳过格式错误的行: {}", e);
                return MatchResult::unresolved(line_id, None, e.to_string());
            }
        };

        let candidates = self.candidates(&attrs).await;
        let outcome = self.engine.run(&attrs, &candidates).await;
        if let Some(hit) = outcome.hit {
            return self.machine.resolved(line_id, attrs, hit);
        }

        match self.creator.create(&attrs, cache).await {
            Ok(entry) => self.machine.auto_created(line_id, attrs, entry),
            Err(e) => {
                let failure = ReconcileError::NoCandidate {
                    line_id,
                    reason: e.to_string(),
                };
                tracing::warn!("{}", failure);
                MatchResult::unresolved(line_id, Some(attrs), failure.to_string())
            }
        }
    }

    /// 批量模式: 只跑级联，不建档
    async fn evaluate_bulk(
        &self,
        line_id: i64,
        prepared: ReconcileResult<ProductAttributes>,
    ) -> Option<MatchResult> {
        let attrs = match prepared {
            Ok(attrs) => attrs,
            Err(e) => {
                tracing::debug!("bulk auto-match skips line {}: {}", line_id, e);
                return None;
            }
        };
        let candidates = self.candidates(&attrs).await;
        let outcome = self.engine.run(&attrs, &candidates).await;
        self.machine.bulk_verdict(line_id, attrs, outcome)
    }

    /// 解析并匹配整张发票 (已 matched 的行不重新评估)
    pub async fn parse_and_match(&self, invoice_id: i64) -> ReconcileResult<Vec<MatchResult>> {
        let start = Instant::now();
        let snapshot = self.load_or_start(invoice_id).await?;
        if snapshot.is_confirmed() {
            return Err(ReconcileError::AlreadyConfirmed(invoice_id));
        }

        let pending: Vec<RawLine> = snapshot
            .lines
            .iter()
            .filter(|l| l.result.status != LineStatus::Matched)
            .map(|l| l.raw.clone())
            .collect();

        let cache = AutoCreateCache::new();
        let results = join_all(
            self.prepare_all(&pending)
                .into_iter()
                .map(|(line_id, prepared)| self.evaluate_line(line_id, prepared, &cache)),
        )
        .await;

        let lock = self.lock_for(invoice_id);
        let _guard = lock.lock().await;
        let mut reconciliation = self.load_or_start(invoice_id).await?;
        self.machine.apply_evaluated(&mut reconciliation, results)?;
        self.repository.save(&reconciliation).await?;

        let counts = reconciliation.counts();
        tracing::info!(
            "发票 {} 解析匹配完成: 评估 {} 行, matched {}, needs_review {}, unmatched {}, 耗时 {:?}",
            invoice_id,
            pending.len(),
            counts.matched,
            counts.needs_review,
            counts.unmatched,
            start.elapsed()
        );
        Ok(reconciliation.results())
    }

    /// 人工指定候选
    pub async fn override_match(&self, line_id: i64, catalog_entry_id: &str) -> ReconcileResult<MatchResult> {
        let invoice_id = self
            .repository
            .find_invoice_for_line(line_id)
            .await?
            .ok_or(ReconcileError::LineNotFound(line_id))?;
        let entry = self
            .catalog
            .get(catalog_entry_id)
            .await?
            .ok_or_else(|| ReconcileError::CatalogEntryNotFound(catalog_entry_id.to_string()))?;

        let lock = self.lock_for(invoice_id);
        let _guard = lock.lock().await;
        let mut reconciliation = self.load_or_start(invoice_id).await?;

        // 从未解析过的行补齐属性，便于审计
        if let Some(line) = reconciliation.line_mut(line_id) {
            if line.result.attributes.is_none() {
                line.result.attributes = self.prepare(&line.raw).ok();
            }
        }

        let result = self.machine.override_line(&mut reconciliation, line_id, entry)?;
        self.repository.save(&reconciliation).await?;

        tracing::info!("人工指定: line {} -> {}", line_id, catalog_entry_id);
        Ok(result)
    }

    /// 批量自动匹配，只提交高置信度结果
    pub async fn auto_match_high_confidence(&self, invoice_id: i64) -> ReconcileResult<AutoMatchSummary> {
        let start = Instant::now();
        let snapshot = self.load_or_start(invoice_id).await?;
        if snapshot.is_confirmed() {
            return Err(ReconcileError::AlreadyConfirmed(invoice_id));
        }

        let pending: Vec<RawLine> = snapshot
            .lines
            .iter()
            .filter(|l| l.result.status == LineStatus::Unmatched)
            .map(|l| l.raw.clone())
            .collect();

        let verdicts: Vec<MatchResult> = join_all(
            self.prepare_all(&pending)
                .into_iter()
                .map(|(line_id, prepared)| self.evaluate_bulk(line_id, prepared)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        let lock = self.lock_for(invoice_id);
        let _guard = lock.lock().await;
        let mut reconciliation = self.load_or_start(invoice_id).await?;
        let summary = self.machine.apply_bulk(&mut reconciliation, verdicts)?;
        self.repository.save(&reconciliation).await?;

        tracing::info!(
            "发票 {} 批量自动匹配: 候选 {} 行, matched {}, needs_review {}, 剩余 unmatched {}, 耗时 {:?}",
            invoice_id,
            pending.len(),
            summary.matched_count,
            summary.needs_review,
            summary.still_unmatched,
            start.elapsed()
        );
        Ok(summary)
    }

    /// 确认发票并提交入库
    ///
    /// 入库失败时发票保持 in_progress，可安全重试。
    pub async fn confirm(&self, invoice_id: i64) -> ReconcileResult<GoodsReceiptId> {
        let lock = self.lock_for(invoice_id);
        let _guard = lock.lock().await;

        let mut reconciliation = self.load_or_start(invoice_id).await?;
        let receipt = self.machine.receipt(&reconciliation).inspect_err(|e| {
            tracing::warn!("发票 {} 确认被拒绝: {}", invoice_id, e);
        })?;

        let receipt_id = self
            .inventory
            .commit_receipt(&receipt)
            .await
            .map_err(|e| match e {
                ReconcileError::ReceiptCommitFailure(_) => e,
                other => ReconcileError::ReceiptCommitFailure(other.to_string()),
            })
            .inspect_err(|e| tracing::error!("发票 {} 入库提交失败: {}", invoice_id, e))?;

        self.machine.mark_confirmed(&mut reconciliation, receipt_id.clone());
        self.repository.save(&reconciliation).await?;

        tracing::info!(
            "✓ 发票 {} 已确认, 入库单 {}, {} 行, 总数量 {}",
            invoice_id,
            receipt_id,
            receipt.lines.len(),
            receipt.total_quantity()
        );
        Ok(receipt_id)
    }

    /// 人工指定前的目录检索，按与查询的相似度降序
    ///
    /// 分词规则与匹配候选相同；limit 缺省或超出时取配置的候选上限。
    pub async fn search_catalog(&self, query: &str, limit: Option<usize>) -> ReconcileResult<Vec<CatalogEntry>> {
        let tokens = search_tokens(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit
            .filter(|l| *l > 0)
            .map_or(self.candidate_limit, |l| l.min(self.candidate_limit));

        let mut found = self.catalog.search_candidates(&tokens, limit).await?;
        let query = query.trim();
        found.sort_by(|a, b| similarity(query, &b.name).total_cmp(&similarity(query, &a.name)));
        tracing::debug!("目录检索 '{}': {} 条", query, found.len());
        Ok(found)
    }

    /// 当前对账状态
    pub async fn reconciliation(&self, invoice_id: i64) -> ReconcileResult<InvoiceReconciliation> {
        self.load_or_start(invoice_id).await
    }

    /// 确认前校验 (不修改状态)
    pub async fn validate(&self, invoice_id: i64) -> ReconcileResult<ValidationReport> {
        let reconciliation = self.load_or_start(invoice_id).await?;
        let counts = reconciliation.counts();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if reconciliation.is_confirmed() {
            errors.push(format!("Invoice {} is already confirmed", invoice_id));
        }
        if reconciliation.lines.is_empty() {
            errors.push("Invoice has no lines".to_string());
        }
        if counts.unresolved() > 0 {
            errors.push(format!("{} line(s) not matched", counts.unresolved()));
        }

        let zero = BigDecimal::zero();
        let mut calculated_total = BigDecimal::zero();
        let mut expected_total = BigDecimal::zero();
        for line in &reconciliation.lines {
            let raw = &line.raw;
            if raw.quantity.as_ref().map_or(true, |q| *q <= zero) {
                errors.push(format!("Line {}: invalid quantity", raw.line_number));
            }
            if raw.unit_price.as_ref().is_some_and(|p| *p <= zero) {
                errors.push(format!("Line {}: invalid unit price", raw.line_number));
            }

            if line.result.status != LineStatus::Matched {
                continue;
            }
            let extended = match (&raw.quantity, &raw.unit_price) {
                (Some(q), Some(p)) => Some(q * p),
                _ => None,
            };
            if let Some(total) = raw.line_total.clone().or_else(|| extended.clone()) {
                calculated_total += total;
            }
            if let Some(extended) = extended {
                expected_total += extended;
            }
        }

        if (&calculated_total - &expected_total).abs() > BigDecimal::from(TOTAL_TOLERANCE) {
            warnings.push(format!(
                "Total mismatch: line totals {}, quantity x price {}",
                calculated_total, expected_total
            ));
        }

        Ok(ValidationReport {
            invoice_id,
            can_confirm: errors.is_empty(),
            errors,
            warnings,
            counts,
            calculated_total,
        })
    }

    /// 审计明细 CSV
    pub async fn export_csv(&self, invoice_id: i64) -> ReconcileResult<Vec<u8>> {
        let reconciliation = self.load_or_start(invoice_id).await?;
        export::audit_csv(&reconciliation)
    }
}

/// 检索关键词: 小写，至少两个字符，保序去重
fn search_tokens(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(str::to_lowercase)
        .filter(|t| t.chars().count() >= 2)
        .collect::<IndexSet<String>>()
        .into_iter()
        .collect()
}
