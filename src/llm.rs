//! Chat-completion client.
//!
//! [`ChatModel`] is the seam between the conversation chain and the language
//! model. [`OpenAIChat`] talks to any OpenAI-compatible
//! `POST {base_url}/chat/completions` endpoint; the model name is chosen per
//! call so one client serves every `llm_name` a query may ask for.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token counts reported by the model, summed across calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Price in USD at the configured per-1000-token rates.
    pub fn cost(&self, rates: &LlmConfig) -> f64 {
        (self.prompt_tokens as f64 / 1000.0) * rates.prompt_cost_per_1k
            + (self.completion_tokens as f64 / 1000.0) * rates.completion_cost_per_1k
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<Completion>;
}

pub struct OpenAIChat {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    temperature: f32,
}

impl OpenAIChat {
    /// Reads `OPENAI_API_KEY` from the environment. Without it requests are
    /// sent unauthenticated, which local OpenAI-compatible servers accept.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY not set; chat completions are unauthenticated");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<Completion> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": self.temperature,
        });

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Chat completion error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }
}

fn parse_completion(json: &serde_json::Value) -> Result<Completion> {
    let text = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat completion response: missing content"))?
        .to_string();

    let usage = json
        .get("usage")
        .map(|u| serde_json::from_value::<TokenUsage>(u.clone()))
        .transpose()?
        .unwrap_or_default();

    Ok(Completion { text, usage })
}
