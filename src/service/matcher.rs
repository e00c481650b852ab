//! 匹配级联
//!
//! exact -> normalized -> attribute-fuzzy -> fuzzy-similarity -> semantic-fallback
//! 前一阶段命中则后续阶段不再执行。级联耗尽后由调用方决定是否自动建档。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::{MatchingConfig, SemanticConfig};
use crate::error::ReconcileError;
use crate::models::{CatalogEntry, MatchStage, ProductAttributes};
use crate::semantic::{SemanticMatcher, SemanticQuery, SemanticVerdict};

pub const EXACT_CONFIDENCE: f64 = 1.0;
pub const NORMALIZED_CONFIDENCE: f64 = 0.95;
pub const ATTRIBUTE_FUZZY_CONFIDENCE: f64 = 0.85;
pub const SEMANTIC_CONFIDENCE: f64 = 0.80;

/// 某阶段选中的候选
#[derive(Debug, Clone, PartialEq)]
pub struct StageHit {
    pub entry: CatalogEntry,
    pub stage: MatchStage,
    /// 对外展示的置信度 (相似度阶段为两位小数)
    pub confidence: f64,
    /// 未舍入的原始分数，阈值比较用它
    pub score: f64,
}

impl StageHit {
    pub fn new(entry: CatalogEntry, stage: MatchStage, confidence: f64) -> Self {
        Self {
            entry,
            stage,
            confidence,
            score: confidence,
        }
    }
}

/// 单阶段结论
#[derive(Debug, Clone, PartialEq)]
pub enum StageVerdict {
    Accept(StageHit),
    /// 未达接受阈值的最佳候选，仅供人工复核参考
    Suggest(StageHit),
    Reject,
}

/// 本地 (同步) 匹配阶段
pub trait MatchStrategy: Send + Sync {
    fn stage(&self) -> MatchStage;
    fn evaluate(&self, attrs: &ProductAttributes, candidates: &[CatalogEntry]) -> StageVerdict;
}

/// 级联结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CascadeOutcome {
    pub hit: Option<StageHit>,
    pub suggestion: Option<StageHit>,
    /// 已恢复的外部错误 (超时等)，仅用于诊断
    pub recovered: Option<ReconcileError>,
}

/// 1. 不区分大小写的全等
pub struct ExactName;

impl MatchStrategy for ExactName {
    fn stage(&self) -> MatchStage {
        MatchStage::Exact
    }

    fn evaluate(&self, attrs: &ProductAttributes, candidates: &[CatalogEntry]) -> StageVerdict {
        let name = attrs.clean_name.to_lowercase();
        accept_first(candidates, self.stage(), EXACT_CONFIDENCE, |c| {
            c.name.to_lowercase() == name
        })
    }
}

/// 2. 去除全部空白后相等
pub struct NormalizedName;

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

impl MatchStrategy for NormalizedName {
    fn stage(&self) -> MatchStage {
        MatchStage::Normalized
    }

    fn evaluate(&self, attrs: &ProductAttributes, candidates: &[CatalogEntry]) -> StageVerdict {
        let name = squash(&attrs.clean_name);
        accept_first(candidates, self.stage(), NORMALIZED_CONFIDENCE, |c| {
            squash(&c.name) == name
        })
    }
}

/// 3. 名称包含首词 且 效价相同 (效价为 NA 时跳过)
pub struct AttributeFuzzy;

impl MatchStrategy for AttributeFuzzy {
    fn stage(&self) -> MatchStage {
        MatchStage::AttributeFuzzy
    }

    fn evaluate(&self, attrs: &ProductAttributes, candidates: &[CatalogEntry]) -> StageVerdict {
        if attrs.potency.is_na() {
            return StageVerdict::Reject;
        }
        let Some(first_token) = attrs.clean_name.split_whitespace().next() else {
            return StageVerdict::Reject;
        };
        let first_token = first_token.to_lowercase();

        accept_first(candidates, self.stage(), ATTRIBUTE_FUZZY_CONFIDENCE, |c| {
            c.potency == attrs.potency && c.name.to_lowercase().contains(&first_token)
        })
    }
}

/// 4. 归一化编辑距离相似度，取最大值
pub struct FuzzySimilarity {
    /// 严格大于才接受
    pub accept_threshold: f64,
}

/// 1 - editDistance / maxLen
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase())
}

pub fn round_confidence(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl MatchStrategy for FuzzySimilarity {
    fn stage(&self) -> MatchStage {
        MatchStage::FuzzySimilarity
    }

    fn evaluate(&self, attrs: &ProductAttributes, candidates: &[CatalogEntry]) -> StageVerdict {
        if attrs.clean_name.is_empty() {
            return StageVerdict::Reject;
        }

        // (相似度, 效价是否一致, 候选)
        let mut best: Option<(f64, bool, &CatalogEntry)> = None;
        for candidate in candidates {
            let score = similarity(&attrs.clean_name, &candidate.name);
            let potency_agrees = !attrs.potency.is_na() && candidate.potency == attrs.potency;

            let is_better = match &best {
                None => true,
                Some((best_score, best_agrees, _)) => {
                    score > *best_score || (score == *best_score && potency_agrees && !best_agrees)
                }
            };
            if is_better {
                best = Some((score, potency_agrees, candidate));
            }
        }

        let Some((score, _, entry)) = best else {
            return StageVerdict::Reject;
        };

        let hit = StageHit {
            entry: entry.clone(),
            stage: self.stage(),
            confidence: round_confidence(score),
            score,
        };
        if score > self.accept_threshold {
            StageVerdict::Accept(hit)
        } else {
            StageVerdict::Suggest(hit)
        }
    }
}

fn accept_first<F>(
    candidates: &[CatalogEntry],
    stage: MatchStage,
    confidence: f64,
    predicate: F,
) -> StageVerdict
where
    F: Fn(&CatalogEntry) -> bool,
{
    candidates
        .iter()
        .find(|c| predicate(c))
        .map(|entry| {
            StageVerdict::Accept(StageHit::new(entry.clone(), stage, confidence))
        })
        .unwrap_or(StageVerdict::Reject)
}

/// 语义阶段: 外部能力 + 超时 + 并发上限
struct SemanticStage {
    matcher: Arc<dyn SemanticMatcher>,
    timeout: Duration,
    max_candidates: usize,
    permits: Semaphore,
}

/// 匹配引擎
pub struct MatchEngine {
    strategies: Vec<Box<dyn MatchStrategy>>,
    semantic: Option<SemanticStage>,
}

impl MatchEngine {
    /// 标准四个本地阶段
    pub fn new(config: &MatchingConfig) -> Self {
        Self::with_strategies(vec![
            Box::new(ExactName),
            Box::new(NormalizedName),
            Box::new(AttributeFuzzy),
            Box::new(FuzzySimilarity {
                accept_threshold: config.fuzzy_accept_threshold,
            }),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn MatchStrategy>>) -> Self {
        Self {
            strategies,
            semantic: None,
        }
    }

    /// 注入语义匹配能力 (第 5 阶段)
    pub fn with_semantic(mut self, matcher: Arc<dyn SemanticMatcher>, config: &SemanticConfig) -> Self {
        self.semantic = Some(SemanticStage {
            matcher,
            timeout: Duration::from_millis(config.timeout_ms),
            max_candidates: config.max_candidates.max(1),
            permits: Semaphore::new(config.max_concurrency.max(1)),
        });
        self
    }

    /// 执行级联，首个接受的阶段胜出
    pub async fn run(&self, attrs: &ProductAttributes, candidates: &[CatalogEntry]) -> CascadeOutcome {
        let mut outcome = CascadeOutcome::default();

        for strategy in &self.strategies {
            match strategy.evaluate(attrs, candidates) {
                StageVerdict::Accept(hit) => {
                    tracing::debug!(
                        "'{}' matched at stage {} -> {} ({:.2})",
                        attrs.clean_name, hit.stage, hit.entry.id, hit.confidence
                    );
                    outcome.hit = Some(hit);
                    return outcome;
                }
                StageVerdict::Suggest(hit) => {
                    if outcome.suggestion.is_none() {
                        outcome.suggestion = Some(hit);
                    }
                }
                StageVerdict::Reject => {}
            }
        }

        if let Some(semantic) = &self.semantic {
            match self.run_semantic(semantic, attrs, candidates).await {
                Ok(hit) => outcome.hit = hit,
                Err(e) => {
                    tracing::warn!("semantic stage skipped for '{}': {}", attrs.clean_name, e);
                    outcome.recovered = Some(e);
                }
            }
        }

        outcome
    }

    async fn run_semantic(
        &self,
        semantic: &SemanticStage,
        attrs: &ProductAttributes,
        candidates: &[CatalogEntry],
    ) -> Result<Option<StageHit>, ReconcileError> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let bounded = &candidates[..candidates.len().min(semantic.max_candidates)];

        let _permit = semantic
            .permits
            .acquire()
            .await
            .map_err(|e| ReconcileError::SemanticMatch(e.to_string()))?;

        let query = SemanticQuery {
            clean_name: &attrs.clean_name,
            brand: &attrs.brand,
            category: attrs.category,
            potency: &attrs.potency,
            candidates: bounded,
        };

        let verdict = tokio::time::timeout(semantic.timeout, semantic.matcher.resolve(&query))
            .await
            .map_err(|_| ReconcileError::ExternalMatchTimeout {
                timeout_ms: semantic.timeout.as_millis() as u64,
            })??;

        Ok(match verdict {
            SemanticVerdict::Candidate(index) if index < bounded.len() => Some(StageHit::new(
                bounded[index].clone(),
                MatchStage::SemanticFallback,
                SEMANTIC_CONFIDENCE,
            )),
            SemanticVerdict::Candidate(index) => {
                tracing::warn!("semantic matcher returned out-of-range index {}", index);
                None
            }
            SemanticVerdict::NoMatch => None,
        })
    }
}
