//! OpenRouter model catalog: free models ranked for dispatch, and the cheapest
//! paid models as a last resort.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, header::AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use tokio::{sync::RwLock, time::Instant};

use crate::{error::CatalogError, provider::truncate_body};

const BANNED: &[&str] = &[
    "openrouter/auto",
    "google/gemma-3n-e2b-it:free",
    "google/gemma-3n-e4b-it:free",
];

const EXCLUDED_PATTERNS: &[&str] = &[
    "gpt-4",
    "gpt-5",
    "claude-3",
    "gemini-pro",
    "mistral-large",
    "mixtral-8x",
    "llama-2-70b",
    "llama-2-13b",
    "command-",
    "auto",
];

const UNKNOWN_COST: f64 = 1e9;

/// One model as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelDescriptor {
    /// Model id used in requests.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Prices as decimal strings.
    #[serde(default)]
    pub pricing: Pricing,
    /// Context window in tokens.
    #[serde(default, deserialize_with = "number_or_string")]
    pub context_length: f64,
    /// Token limits of a single request.
    #[serde(default)]
    pub per_request_limits: Option<PerRequestLimits>,
}

/// Model prices. Empty fields are free.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Pricing {
    /// Per prompt token.
    #[serde(default)]
    pub prompt: String,
    /// Per completion token.
    #[serde(default)]
    pub completion: String,
    /// Per request.
    #[serde(default)]
    pub request: String,
    /// Per image.
    #[serde(default)]
    pub image: String,
}

/// Per-request token limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct PerRequestLimits {
    /// Prompt tokens.
    #[serde(default, deserialize_with = "number_or_string")]
    pub prompt_tokens: f64,
    /// Completion tokens.
    #[serde(default, deserialize_with = "number_or_string")]
    pub completion_tokens: f64,
}

impl ModelDescriptor {
    /// Free of charge and not excluded from rotation.
    pub fn is_free(&self) -> bool {
        let id = self.id.to_lowercase();

        if BANNED.contains(&id.as_str()) || EXCLUDED_PATTERNS.iter().any(|p| id.contains(p)) {
            return false;
        }

        let pricing = &self.pricing;

        [&pricing.prompt, &pricing.completion, &pricing.request, &pricing.image]
            .into_iter()
            .all(|price| matches!(price.as_str(), "" | "0" | "0.0"))
    }

    /// Tokens one request can carry. Higher is better.
    pub fn capacity_score(&self) -> f64 {
        let per_request = self
            .per_request_limits
            .map(|limits| limits.prompt_tokens + limits.completion_tokens)
            .unwrap_or_default();

        if per_request <= 0.0 && self.context_length > 0.0 {
            return self.context_length;
        }

        per_request
    }

    /// Comparable price of one request. Lower is better.
    pub fn effective_price(&self) -> f64 {
        let request = parse_price(&self.pricing.request);

        if request > 0.0 {
            return request;
        }

        parse_price(&self.pricing.prompt) + parse_price(&self.pricing.completion)
    }

    fn paid_cost(&self) -> f64 {
        match self.effective_price() {
            cost if cost > 0.0 => cost,
            _ => UNKNOWN_COST,
        }
    }
}

/// Keeps the leading decimal number of a price, ignoring currency symbols and units.
pub fn parse_price(raw: &str) -> f64 {
    let cleaned = raw.trim_start_matches(['$', '€', '£']).trim();
    let end = cleaned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(cleaned.len());

    cleaned[..end].parse().unwrap_or_default()
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
        Null(()),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(s) => s.trim().parse().unwrap_or_default(),
        Raw::Null(()) => 0.0,
    })
}

/// Source of candidate model ids.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Free models, best first.
    async fn free_models(&self) -> Result<Vec<ModelDescriptor>, CatalogError>;

    /// Up to `limit` paid models, cheapest first.
    async fn cheapest_paid_models(&self, limit: usize) -> Result<Vec<ModelDescriptor>, CatalogError>;

    /// Refetches the list now.
    async fn refresh(&self) -> Result<(), CatalogError>;
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelDescriptor>,
}

struct Cached {
    models: Arc<Vec<ModelDescriptor>>,
    fetched_at: Instant,
}

/// The OpenRouter `/models` listing, cached for the refresh interval.
///
/// When a refresh fails the previous listing keeps being served.
pub struct OpenRouterCatalog {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    refresh_interval: Duration,
    cache: RwLock<Option<Cached>>,
}

impl OpenRouterCatalog {
    /// Creates a catalog reading `{base_url}/models`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
        refresh_interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            refresh_interval,
            cache: RwLock::new(None),
        })
    }

    async fn fetch(&self) -> Result<Vec<ModelDescriptor>, CatalogError> {
        let url = format!("{}/models", self.base_url);
        let mut request = self.client.get(&url);

        match &self.api_key {
            Some(key) => request = request.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret())),
            None => log::warn!("Fetching the OpenRouter model list without an API key"),
        }

        let response = request
            .send()
            .await
            .map_err(|e| CatalogError::Connection(e.to_string()))?;

        let status = response.status();

        let body = response
            .text()
            .await
            .map_err(|e| CatalogError::Connection(e.to_string()))?;

        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                message: truncate_body(&body),
            });
        }

        let parsed: ModelsResponse = sonic_rs::from_str(&body).map_err(|e| CatalogError::Decode(e.to_string()))?;

        log::debug!("Fetched {} models from {url}", parsed.data.len());

        Ok(parsed.data)
    }

    /// All listed models, fetching when the cache is empty or expired.
    async fn all_models(&self) -> Result<Arc<Vec<ModelDescriptor>>, CatalogError> {
        {
            let cache = self.cache.read().await;

            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < self.refresh_interval
            {
                return Ok(cached.models.clone());
            }
        }

        let mut cache = self.cache.write().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() < self.refresh_interval
        {
            return Ok(cached.models.clone());
        }

        match self.fetch().await {
            Ok(models) => {
                let models = Arc::new(models);

                *cache = Some(Cached {
                    models: models.clone(),
                    fetched_at: Instant::now(),
                });

                Ok(models)
            }
            Err(e) => match cache.as_ref() {
                Some(stale) => {
                    log::warn!("Serving stale model list after refresh failure: {e}");
                    Ok(stale.models.clone())
                }
                None => Err(e),
            },
        }
    }
}

#[async_trait]
impl ModelCatalog for OpenRouterCatalog {
    async fn free_models(&self) -> Result<Vec<ModelDescriptor>, CatalogError> {
        let models = self.all_models().await?;

        let mut free: Vec<ModelDescriptor> = models.iter().filter(|m| m.is_free()).cloned().collect();

        free.sort_by(|a, b| {
            b.capacity_score()
                .total_cmp(&a.capacity_score())
                .then_with(|| a.effective_price().total_cmp(&b.effective_price()))
        });

        log::debug!("{} of {} models are free", free.len(), models.len());

        Ok(free)
    }

    async fn cheapest_paid_models(&self, limit: usize) -> Result<Vec<ModelDescriptor>, CatalogError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let models = self.all_models().await?;

        let mut paid: Vec<ModelDescriptor> = models
            .iter()
            .filter(|m| !m.is_free() && !m.id.eq_ignore_ascii_case("openrouter/auto"))
            .cloned()
            .collect();

        paid.sort_by(|a, b| a.paid_cost().total_cmp(&b.paid_cost()));
        paid.truncate(limit);

        Ok(paid)
    }

    async fn refresh(&self) -> Result<(), CatalogError> {
        let models = self.fetch().await?;

        *self.cache.write().await = Some(Cached {
            models: Arc::new(models),
            fetched_at: Instant::now(),
        });

        Ok(())
    }
}
