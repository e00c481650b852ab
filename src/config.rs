use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::ReconcileResult;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub matching: MatchingConfig,
    pub semantic: SemanticConfig,
    pub brands: Vec<BrandAlias>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// 超过该耗时的语句以 warn 记录
    pub slow_statement_secs: u64,
}

/// 匹配阈值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// 低于该值视为 unmatched
    pub review_threshold: f64,
    /// 达到该值视为 matched
    pub matched_threshold: f64,
    /// 相似度必须严格大于该值才接受
    pub fuzzy_accept_threshold: f64,
    /// 批量自动匹配时相似度阶段的提交门槛 (严格大于)
    pub auto_commit_threshold: f64,
    /// 每行候选数量上限
    pub candidate_limit: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.60,
            matched_threshold: 0.85,
            fuzzy_accept_threshold: 0.85,
            auto_commit_threshold: 0.90,
            candidate_limit: 50,
        }
    }
}

/// 语义匹配兜底 (可选)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub max_candidates: usize,
    pub max_concurrency: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_ms: 5000,
            max_candidates: 50,
            max_concurrency: 4,
        }
    }
}

impl SemanticConfig {
    /// 启用且配置了密钥才构建
    pub fn is_active(&self) -> bool {
        self.enabled && self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// 品牌别名 -> 标准品牌名
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandAlias {
    pub alias: String,
    pub brand: String,
}

impl BrandAlias {
    pub fn new(alias: &str, brand: &str) -> Self {
        Self {
            alias: alias.to_string(),
            brand: brand.to_string(),
        }
    }
}

/// 内置品牌别名表，按顺序匹配
pub fn default_brand_aliases() -> Vec<BrandAlias> {
    [
        ("WSI", "Schwabe India"),
        ("W S I", "Schwabe India"),
        ("SCHWABE", "Schwabe India"),
        ("SBL", "SBL"),
        ("BAKSON", "Bakson"),
        ("BJAIN", "Bjain"),
        ("RECKEWEG", "Dr. Reckeweg"),
        ("RECKWEG", "Dr. Reckeweg"),
        ("HAHNEMANN", "Hahnemann Labs"),
        ("ALLEN", "Allen"),
        ("MEDISYNTH", "Medisynth"),
        ("LORDS", "Lords"),
        ("ADEVEN", "Adven Biotech"),
        ("WHEEZAL", "Wheezal"),
        ("HAPDCO", "HAPDCO"),
        ("B T", "B T"),
        ("PHBL", "PHBL"),
        ("SSL", "SSL"),
    ]
    .into_iter()
    .map(|(alias, brand)| BrandAlias::new(alias, brand))
    .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/invoice_reconcile".to_string(),
                max_connections: 20,
                acquire_timeout_secs: 10,
                slow_statement_secs: 5,
            },
            matching: MatchingConfig::default(),
            semantic: SemanticConfig::default(),
            brands: default_brand_aliases(),
        }
    }
}

impl AppConfig {
    /// 加载配置: 默认值 -> 配置文件 -> RECONCILE__* 环境变量 -> 兼容旧环境变量
    pub fn load() -> ReconcileResult<Self> {
        let path = std::env::var("RECONCILE_CONFIG")
            .unwrap_or_else(|_| "config/reconcile".to_string());

        let config = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::with_prefix("RECONCILE").separator("__"))
            .set_override_option("server.host", std::env::var("SERVER_HOST").ok())?
            .set_override_option(
                "server.port",
                std::env::var("SERVER_PORT").ok().filter(|p| p.parse::<u16>().is_ok()),
            )?
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("semantic.api_key", std::env::var("SEMANTIC_API_KEY").ok())?
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
