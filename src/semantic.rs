//! 语义匹配兜底
//!
//! 作为可注入能力使用: 未配置时级联直接跳过该阶段。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SemanticConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::models::{CatalogEntry, Category, Potency};

/// 语义匹配请求
#[derive(Debug, Clone)]
pub struct SemanticQuery<'a> {
    pub clean_name: &'a str,
    pub brand: &'a str,
    pub category: Category,
    pub potency: &'a Potency,
    /// 已截断到上限的候选列表
    pub candidates: &'a [CatalogEntry],
}

/// 语义匹配结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticVerdict {
    /// 候选下标 (从 0 开始)
    Candidate(usize),
    NoMatch,
}

#[async_trait]
pub trait SemanticMatcher: Send + Sync {
    async fn resolve(&self, query: &SemanticQuery<'_>) -> ReconcileResult<SemanticVerdict>;
}

/// OpenAI 兼容的 chat completion 客户端
pub struct HttpSemanticMatcher {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl HttpSemanticMatcher {
    pub fn from_config(config: &SemanticConfig) -> ReconcileResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ReconcileError::Config("semantic.api_key is not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ReconcileError::Config(format!("semantic client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }
}

/// 构建提示词，候选从 1 开始编号
pub fn build_prompt(query: &SemanticQuery<'_>) -> String {
    let listing = query
        .candidates
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {} ({}, {})", i + 1, c.name, c.brand, c.potency))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Find the best matching product from the list below for this product:\n\n\
         Product to match:\n- Name: {}\n- Brand: {}\n- Category: {}\n- Potency: {}\n\n\
         Existing products:\n{}\n\n\
         Return ONLY the product number (1-{}) if there's a match with >80% confidence, \
         or \"NO_MATCH\" if no good match exists.",
        query.clean_name,
        query.brand,
        query.category,
        query.potency,
        listing,
        query.candidates.len()
    )
}

/// 解析模型回复: 1 起编号 -> 0 起下标
pub fn parse_reply(reply: &str, candidate_count: usize) -> SemanticVerdict {
    let reply = reply.trim().trim_end_matches('.');
    match reply.parse::<usize>() {
        Ok(n) if n >= 1 && n <= candidate_count => SemanticVerdict::Candidate(n - 1),
        _ => SemanticVerdict::NoMatch,
    }
}

#[async_trait]
impl SemanticMatcher for HttpSemanticMatcher {
    async fn resolve(&self, query: &SemanticQuery<'_>) -> ReconcileResult<SemanticVerdict> {
        if query.candidates.is_empty() {
            return Ok(SemanticVerdict::NoMatch);
        }

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: build_prompt(query),
            }],
            temperature: 0.1,
            max_tokens: 10,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ReconcileError::SemanticMatch(e.to_string()))?
            .error_for_status()
            .map_err(|e| ReconcileError::SemanticMatch(e.to_string()))?;

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ReconcileError::SemanticMatch(e.to_string()))?;

        let reply = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("NO_MATCH");

        tracing::debug!("semantic reply for '{}': {:?}", query.clean_name, reply);
        Ok(parse_reply(reply, query.candidates.len()))
    }
}
