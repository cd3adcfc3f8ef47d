//! Chat-completion clients.
//!
//! The orchestrator talks to one [`ChatModel`]; implementations cover any
//! OpenAI-compatible endpoint plus Anthropic's native messages API. The
//! system prompt is prepended per request — conversation history holds
//! only user/assistant messages.

use crate::asr::provider_error;
use crate::error::{PipelineError, PipelineResult, Stage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;
use voicebench_shared::StageMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

/// Token counts reported by the provider; zero when not reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

/// A finished chat completion.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub usage: TokenUsage,
    pub metrics: StageMetrics,
}

/// Chat-completion seam.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate a reply to the conversation so far (user/assistant
    /// messages only; the implementation supplies its own system prompt).
    async fn generate(&self, history: &[ChatMessage]) -> PipelineResult<LlmReply>;
}

fn http_client() -> PipelineResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .map_err(|e| PipelineError::Llm(e.to_string()))
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Debug, Clone)]
pub struct OpenAiCompatChat {
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    client: reqwest::Client,
}

impl OpenAiCompatChat {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> PipelineResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            client: http_client()?,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatChat {
    async fn generate(&self, history: &[ChatMessage]) -> PipelineResult<LlmReply> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend_from_slice(history);

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": 150,
            "temperature": 0.7,
        });

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Llm(e.to_string()))?;
        let ttfb_ms = started.elapsed().as_secs_f64() * 1000.0;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(provider_error(Stage::Llm, status, body));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Llm(e.to_string()))?;
        let total_ms = started.elapsed().as_secs_f64() * 1000.0;

        let text = json
            .pointer("/choices/0/message/content")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();
        let usage = TokenUsage {
            input: json
                .pointer("/usage/prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output: json
                .pointer("/usage/completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        };
        debug!(model = %self.model, ttfb_ms, total_ms, "chat completion finished");

        Ok(LlmReply {
            text,
            usage,
            metrics: StageMetrics::new(ttfb_ms, total_ms),
        })
    }
}

/// Anthropic native `/v1/messages` client.
#[derive(Debug, Clone)]
pub struct AnthropicChat {
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    client: reqwest::Client,
}

impl AnthropicChat {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> PipelineResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            client: http_client()?,
        })
    }
}

#[async_trait]
impl ChatModel for AnthropicChat {
    async fn generate(&self, history: &[ChatMessage]) -> PipelineResult<LlmReply> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));

        // System content travels in its own field here.
        let messages: Vec<serde_json::Value> = history
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": if m.role == Role::User { "user" } else { "assistant" },
                    "content": m.content,
                })
            })
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 150,
            "system": self.system_prompt,
            "messages": messages,
        });

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Llm(e.to_string()))?;
        let ttfb_ms = started.elapsed().as_secs_f64() * 1000.0;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(provider_error(Stage::Llm, status, body));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Llm(e.to_string()))?;
        let total_ms = started.elapsed().as_secs_f64() * 1000.0;

        let text = json
            .pointer("/content/0/text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();
        let usage = TokenUsage {
            input: json
                .pointer("/usage/input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output: json
                .pointer("/usage/output_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        };

        Ok(LlmReply {
            text,
            usage,
            metrics: StageMetrics::new(ttfb_ms, total_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_lowercase() {
        let msg = ChatMessage::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hi");

        let sys = serde_json::to_value(ChatMessage::system("p")).unwrap();
        assert_eq!(sys["role"], "system");
    }

    #[test]
    fn usage_defaults_to_zero() {
        let usage = TokenUsage::default();
        assert_eq!(usage.input, 0);
        assert_eq!(usage.output, 0);
    }
}
