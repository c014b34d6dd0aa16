//! Configuration
//!
//! Defaults, optional JSON file, then environment overrides. The binary loads `.env`
//! before calling [`CopilotConfig::from_env`].

use crate::error::{CopilotError, Result};
use crate::judge::MAX_SCORE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Language-model provider, chosen once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    /// CodeQwen served from an OpenAI-compatible local endpoint
    Qwen,
    /// Nxcode served from an OpenAI-compatible local endpoint
    Ntqai,
}

impl LlmProvider {
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4o-mini",
            LlmProvider::Anthropic => "claude-3-5-sonnet-latest",
            LlmProvider::Qwen => "CodeQwen1.5-7B-Chat",
            LlmProvider::Ntqai => "Nxcode-CQ-7B-orpo",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "https://api.openai.com/v1",
            LlmProvider::Anthropic => "https://api.anthropic.com/v1",
            LlmProvider::Qwen | LlmProvider::Ntqai => "http://localhost:8000/v1",
        }
    }

    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            LlmProvider::OpenAi => Some("OPENAI_API_KEY"),
            LlmProvider::Anthropic => Some("ANTHROPIC_API_KEY"),
            LlmProvider::Qwen | LlmProvider::Ntqai => None,
        }
    }
}

impl FromStr for LlmProvider {
    type Err = CopilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" => Ok(LlmProvider::Anthropic),
            "qwen" => Ok(LlmProvider::Qwen),
            "ntqai" => Ok(LlmProvider::Ntqai),
            other => Err(CopilotError::Config(format!("unknown LLM provider '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    OpenAi,
    /// Hashed term-frequency vectors, computed locally
    Hashed,
}

impl FromStr for EmbeddingProvider {
    type Err = CopilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(EmbeddingProvider::OpenAi),
            "hashed" => Ok(EmbeddingProvider::Hashed),
            other => Err(CopilotError::Config(format!(
                "unknown embedding provider '{}'",
                other
            ))),
        }
    }
}

/// How the judge gates resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorMode {
    Disabled,
    /// Scores gate resolution; an unavailable judge accepts the attempt.
    Advisory,
    /// Scores gate resolution; an unavailable judge aborts the session.
    Mandatory,
}

impl FromStr for ValidatorMode {
    type Err = CopilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "disabled" | "off" => Ok(ValidatorMode::Disabled),
            "advisory" => Ok(ValidatorMode::Advisory),
            "mandatory" => Ok(ValidatorMode::Mandatory),
            other => Err(CopilotError::Config(format!("unknown validator mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAi,
            model: None,
            api_key: None,
            base_url: None,
            timeout_secs: 60,
            temperature: 0.0,
            max_tokens: 1024,
        }
    }
}

impl LlmConfig {
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashed,
            model: "text-embedding-3-small".to_string(),
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            dimension: 384,
        }
    }
}

/// Policy of the generate / execute / judge / repair loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub max_attempts: u32,
    /// Minimum judge score (0-10) for a session to resolve.
    pub acceptance_threshold: f32,
    /// Cosine similarity below which a schema element is not bound to a term.
    pub similarity_floor: f32,
    pub top_k: usize,
    pub validator: ValidatorMode,
    pub validation_timeout_secs: u64,
    /// Consecutive `Unknown` execution failures after which the session aborts.
    pub max_unknown_failures: u32,
    pub static_name_check: bool,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            acceptance_threshold: 7.0,
            similarity_floor: 0.35,
            top_k: 5,
            validator: ValidatorMode::Advisory,
            validation_timeout_secs: 60,
            max_unknown_failures: 2,
            static_name_check: true,
        }
    }
}

impl FeedbackConfig {
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_secs: u64,
    pub max_rows: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_rows: 1000,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CopilotConfig {
    pub database_url: String,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub feedback: FeedbackConfig,
    pub execution: ExecutionConfig,
    pub session_log: Option<PathBuf>,
    pub concurrency: usize,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://sales_demo.db".to_string(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            feedback: FeedbackConfig::default(),
            execution: ExecutionConfig::default(),
            session_log: None,
            concurrency: 4,
        }
    }
}

impl CopilotConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: CopilotConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Defaults (or `base`) overridden by environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup. Split out from [`from_env`](Self::from_env)
    /// so tests can feed a map instead of mutating the process environment.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SQLPILOT_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            self.database_url = url;
        }
        if let Some(provider) = lookup("SQLPILOT_LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        if let Some(model) = lookup("SQLPILOT_LLM_MODEL") {
            self.llm.model = Some(model);
        }
        if let Some(url) = lookup("SQLPILOT_LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        if self.llm.api_key.is_none() {
            self.llm.api_key = lookup("SQLPILOT_LLM_API_KEY")
                .or_else(|| self.llm.provider.api_key_env().and_then(|key| lookup(key)));
        }
        if let Some(provider) = lookup("SQLPILOT_EMBEDDING_PROVIDER") {
            self.embedding.provider = provider.parse()?;
        }
        if let Some(model) = lookup("SQLPILOT_EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if self.embedding.api_key.is_none() {
            self.embedding.api_key = lookup("OPENAI_API_KEY");
        }
        if let Some(v) = lookup("SQLPILOT_MAX_ATTEMPTS") {
            self.feedback.max_attempts = parse_number("SQLPILOT_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("SQLPILOT_ACCEPTANCE_THRESHOLD") {
            self.feedback.acceptance_threshold = parse_number("SQLPILOT_ACCEPTANCE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("SQLPILOT_SIMILARITY_FLOOR") {
            self.feedback.similarity_floor = parse_number("SQLPILOT_SIMILARITY_FLOOR", &v)?;
        }
        if let Some(v) = lookup("SQLPILOT_TOP_K") {
            self.feedback.top_k = parse_number("SQLPILOT_TOP_K", &v)?;
        }
        if let Some(v) = lookup("SQLPILOT_VALIDATOR") {
            self.feedback.validator = v.parse()?;
        }
        if let Some(v) = lookup("SQLPILOT_QUERY_TIMEOUT_SECS") {
            self.execution.timeout_secs = parse_number("SQLPILOT_QUERY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("SQLPILOT_MAX_ROWS") {
            self.execution.max_rows = parse_number("SQLPILOT_MAX_ROWS", &v)?;
        }
        if let Some(path) = lookup("SQLPILOT_SESSION_LOG") {
            self.session_log = Some(PathBuf::from(path));
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let feedback = &self.feedback;
        if feedback.max_attempts == 0 {
            return Err(CopilotError::Config("max_attempts must be at least 1".to_string()));
        }
        if !(0.0..=MAX_SCORE).contains(&feedback.acceptance_threshold) {
            return Err(CopilotError::Config(format!(
                "acceptance_threshold {} is outside 0..={}",
                feedback.acceptance_threshold, MAX_SCORE
            )));
        }
        if !(-1.0..=1.0).contains(&feedback.similarity_floor) {
            return Err(CopilotError::Config(format!(
                "similarity_floor {} is outside -1..=1",
                feedback.similarity_floor
            )));
        }
        if feedback.top_k == 0 {
            return Err(CopilotError::Config("top_k must be at least 1".to_string()));
        }
        if self.embedding.dimension == 0 {
            return Err(CopilotError::Config("embedding dimension must be positive".to_string()));
        }
        if self.concurrency == 0 {
            return Err(CopilotError::Config("concurrency must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| CopilotError::Config(format!("{} has invalid value '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = CopilotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.feedback.max_attempts, 3);
        assert_eq!(config.feedback.top_k, 5);
        assert_eq!(config.llm.model(), "gpt-4o-mini");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SQLPILOT_LLM_PROVIDER", "anthropic"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("SQLPILOT_MAX_ATTEMPTS", "5"),
            ("SQLPILOT_VALIDATOR", "mandatory"),
            ("SQLPILOT_DATABASE_URL", "postgres://localhost/shop"),
        ]
        .into_iter()
        .collect();

        let config = CopilotConfig::default()
            .with_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.llm.provider, LlmProvider::Anthropic);
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-ant"));
        assert_eq!(config.llm.model(), "claude-3-5-sonnet-latest");
        assert_eq!(config.feedback.max_attempts, 5);
        assert_eq!(config.feedback.validator, ValidatorMode::Mandatory);
        assert_eq!(config.database_url, "postgres://localhost/shop");
    }

    #[test]
    fn test_invalid_env_value_is_config_error() {
        let result = CopilotConfig::default().with_env_overrides(|k| {
            (k == "SQLPILOT_MAX_ATTEMPTS").then(|| "three".to_string())
        });
        assert!(matches!(result, Err(CopilotError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_attempts_and_bad_threshold() {
        let mut config = CopilotConfig::default();
        config.feedback.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = CopilotConfig::default();
        config.feedback.acceptance_threshold = 11.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: CopilotConfig =
            serde_json::from_str(r#"{"feedback": {"max_attempts": 4}, "llm": {"provider": "qwen"}}"#)
                .unwrap();
        assert_eq!(config.feedback.max_attempts, 4);
        assert_eq!(config.feedback.top_k, 5);
        assert_eq!(config.llm.provider, LlmProvider::Qwen);
        assert_eq!(config.llm.base_url(), "http://localhost:8000/v1");
    }
}
