//! Upstream provider account configuration.

use std::time::Duration;

use duration_str::deserialize_duration;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// Configured upstream providers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidersConfig {
    /// Groq free-tier accounts.
    #[serde(default)]
    pub groq: Option<GroqConfig>,
    /// OpenRouter accounts.
    #[serde(default)]
    pub openrouter: Option<OpenRouterConfig>,
    /// OpenAI account used for embeddings.
    #[serde(default)]
    pub openai: Option<OpenAiConfig>,
}

impl ProvidersConfig {
    /// Number of usable chat accounts across all providers.
    pub fn chat_account_count(&self) -> usize {
        let groq = self.groq.as_ref().map(|c| usable_keys(&c.api_keys).count()).unwrap_or(0);
        let openrouter = self
            .openrouter
            .as_ref()
            .map(|c| usable_keys(&c.api_keys).count())
            .unwrap_or(0);

        groq + openrouter
    }
}

/// Iterates the keys that are neither empty nor whitespace.
pub fn usable_keys(keys: &[SecretString]) -> impl Iterator<Item = &SecretString> {
    keys.iter().filter(|key| !key.expose_secret().trim().is_empty())
}

/// OpenRouter provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenRouterConfig {
    /// API keys, one per account. Empty entries are ignored.
    pub api_keys: Vec<SecretString>,
    /// API base URL.
    pub base_url: String,
    /// Value of the `HTTP-Referer` header.
    pub referer: Option<String>,
    /// Value of the `X-Title` header.
    pub title: Option<String>,
    /// Minimum interval between calls from one worker process.
    #[serde(deserialize_with = "deserialize_duration")]
    pub min_interval: Duration,
    /// Seeds every account bucket with this per-minute policy.
    pub requests_per_minute: Option<u32>,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            referer: None,
            title: Some("AI CV Evaluator".to_string()),
            min_interval: Duration::from_secs(5),
            requests_per_minute: None,
        }
    }
}

/// Groq provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroqConfig {
    /// API keys, one per account. Empty entries are ignored.
    pub api_keys: Vec<SecretString>,
    /// API base URL.
    pub base_url: String,
    /// Minimum interval between calls from one worker process.
    #[serde(deserialize_with = "deserialize_duration")]
    pub min_interval: Duration,
    /// Explicit model list. When unset the list is discovered from the API.
    pub models: Option<Vec<String>>,
    /// Seeds every account bucket with this per-minute policy.
    pub requests_per_minute: Option<u32>,
}

impl Default for GroqConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            min_interval: Duration::from_secs(4),
            models: None,
            requests_per_minute: None,
        }
    }
}

/// OpenAI configuration, used for embeddings only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenAiConfig {
    /// API key.
    pub api_key: Option<SecretString>,
    /// API base URL.
    pub base_url: String,
    /// Embeddings model id.
    pub embeddings_model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            embeddings_model: "text-embedding-3-small".to_string(),
        }
    }
}
