//! Generation capability
//!
//! The language model is an untrusted, nondeterministic oracle behind [`LanguageModel`].
//! [`LlmClient`] speaks to the configured provider over HTTP; every provider-specific
//! failure surfaces as `GenerationUnavailable` or `GenerationTimeout`.

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{CopilotError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// What a generation call is for; providers may tune sampling per purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Purpose {
    Generation,
    Repair,
    Judging,
}

/// Structured context accompanying a prompt.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub system: String,
    pub purpose: Purpose,
    /// Overrides the client's configured temperature when set.
    pub temperature: Option<f32>,
}

impl GenerationContext {
    pub fn new(system: impl Into<String>, purpose: Purpose) -> Self {
        Self {
            system: system.into(),
            purpose,
            temperature: None,
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, context: &GenerationContext) -> Result<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    provider: LlmProvider,
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config.api_key.clone().filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            if let Some(var) = config.provider.api_key_env() {
                return Err(CopilotError::Config(format!(
                    "{:?} provider needs an API key (set {})",
                    config.provider, var
                )));
            }
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| CopilotError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            provider: config.provider,
            api_key,
            base_url: config.base_url().trim_end_matches('/').to_string(),
            model: config.model(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: config.timeout(),
            http,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    fn transport_error(&self, err: reqwest::Error) -> CopilotError {
        if err.is_timeout() {
            CopilotError::GenerationTimeout(self.timeout)
        } else {
            CopilotError::GenerationUnavailable(format!("{:?} request failed: {}", self.provider, err))
        }
    }

    async fn post_json(&self, url: String, body: serde_json::Value) -> Result<serde_json::Value> {
        let mut request = self.http.post(&url).json(&body);
        request = match self.provider {
            LlmProvider::Anthropic => request
                .header("x-api-key", self.api_key.clone().unwrap_or_default())
                .header("anthropic-version", "2023-06-01"),
            _ => match &self.api_key {
                Some(key) => request.header("Authorization", format!("Bearer {}", key)),
                None => request,
            },
        };

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            warn!("{:?} returned {}: {}", self.provider, status, error_text);
            return Err(CopilotError::GenerationUnavailable(format!(
                "{:?} API error ({}): {}",
                self.provider, status, error_text
            )));
        }

        response.json().await.map_err(|e| {
            CopilotError::GenerationUnavailable(format!("Failed to parse provider response: {}", e))
        })
    }

    async fn chat_completion(&self, prompt: &str, context: &GenerationContext) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": context.system },
                { "role": "user", "content": prompt },
            ],
            "temperature": context.temperature.unwrap_or(self.temperature),
            "max_tokens": self.max_tokens,
        });
        let json = self
            .post_json(format!("{}/chat/completions", self.base_url), body)
            .await?;

        json.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| CopilotError::GenerationUnavailable("No content in completion response".to_string()))
    }

    async fn anthropic_message(&self, prompt: &str, context: &GenerationContext) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": context.system,
            "temperature": context.temperature.unwrap_or(self.temperature),
            "messages": [ { "role": "user", "content": prompt } ],
        });
        let json = self.post_json(format!("{}/messages", self.base_url), body).await?;

        let text: String = json
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(CopilotError::GenerationUnavailable(
                "No text content in Anthropic response".to_string(),
            ));
        }
        Ok(text)
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, context: &GenerationContext) -> Result<String> {
        debug!(
            "Calling {:?} model {} for {:?} ({} prompt chars)",
            self.provider,
            self.model,
            context.purpose,
            prompt.len()
        );
        match self.provider {
            LlmProvider::Anthropic => self.anthropic_message(prompt, context).await,
            LlmProvider::OpenAi | LlmProvider::Qwen | LlmProvider::Ntqai => {
                self.chat_completion(prompt, context).await
            }
        }
    }
}

/// Strip markdown code fences (```json, ```sql, ```) around a model response.
pub fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after_open = &trimmed[start + 3..];
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let first_line = &after_open[..body_start];
    // An opening fence line holds at most a language tag.
    let body = if first_line.trim().chars().all(|c| c.is_alphanumeric()) {
        &after_open[body_start..]
    } else {
        after_open
    };
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}
