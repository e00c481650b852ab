use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::catalog::CatalogEntry;
use super::line::ProductAttributes;

/// 匹配阶段 (审计用来源标记)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchStage {
    Exact,
    Normalized,
    AttributeFuzzy,
    FuzzySimilarity,
    SemanticFallback,
    AutoCreated,
    Manual,
}

impl MatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStage::Exact => "exact",
            MatchStage::Normalized => "normalized",
            MatchStage::AttributeFuzzy => "attribute-fuzzy",
            MatchStage::FuzzySimilarity => "fuzzy-similarity",
            MatchStage::SemanticFallback => "semantic-fallback",
            MatchStage::AutoCreated => "auto-created",
            MatchStage::Manual => "manual",
        }
    }
}

impl fmt::Display for MatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 行状态，由置信度阈值推导
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineStatus {
    Unmatched,
    NeedsReview,
    Matched,
}

impl LineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineStatus::Unmatched => "unmatched",
            LineStatus::NeedsReview => "needs_review",
            LineStatus::Matched => "matched",
        }
    }
}

impl fmt::Display for LineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 行匹配结果 (MatchResult)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub line_id: i64,
    pub attributes: Option<ProductAttributes>,   // 行格式错误时为空
    pub entry: Option<CatalogEntry>,             // 为空即未解决
    pub stage: Option<MatchStage>,
    pub confidence: f64,
    pub status: LineStatus,
    pub diagnostic: Option<String>,
    pub matched_at: DateTime<Utc>,
}

impl MatchResult {
    /// 尚未评估的行
    pub fn pending(line_id: i64) -> Self {
        Self {
            line_id,
            attributes: None,
            entry: None,
            stage: None,
            confidence: 0.0,
            status: LineStatus::Unmatched,
            diagnostic: None,
            matched_at: Utc::now(),
        }
    }

    /// 无候选的结果，附带诊断信息
    pub fn unresolved(line_id: i64, attributes: Option<ProductAttributes>, diagnostic: String) -> Self {
        Self {
            attributes,
            diagnostic: Some(diagnostic),
            ..Self::pending(line_id)
        }
    }

    pub fn is_matched(&self) -> bool {
        self.status == LineStatus::Matched
    }
}
