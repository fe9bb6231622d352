use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use config::{CatalogConfig, GroqConfig};
use mini_moka::sync::Cache;
use reqwest::header::HeaderMap;
use tokio::sync::RwLock;

use super::{Account, ChatCall, OpenAiCompatible, Pacer, Provider, ProviderFailure, ProviderReply};
use crate::error::CatalogError;

/// Provider name, also the bucket key namespace.
pub const GROQ: &str = "groq";

/// Longest pause between listing attempts after a failed one.
const RETRY_FAILED_LISTING: Duration = Duration::from_secs(60);

/// Free tier limits as (model, requests per minute, tokens per minute).
const KNOWN_LIMITS: &[(&str, u32, u32)] = &[
    ("llama-3.1-8b-instant", 30, 6_000),
    ("llama-3.3-70b-versatile", 30, 12_000),
    ("openai/gpt-oss-20b", 30, 8_000),
    ("openai/gpt-oss-120b", 30, 8_000),
    ("qwen/qwen3-32b", 60, 6_000),
    ("meta-llama/llama-4-maverick-17b-128e-instruct", 30, 6_000),
    ("meta-llama/llama-4-scout-17b-16e-instruct", 30, 30_000),
];

/// Groq's OpenAI-compatible API.
pub struct GroqProvider {
    http: OpenAiCompatible,
    accounts: Vec<Account>,
    configured_models: Option<Vec<String>>,
    listing_timeout: Duration,
    discovered: Cache<(), Arc<Vec<String>>>,
    failed_listing: Cache<(), ()>,
    last_known: RwLock<Option<Arc<Vec<String>>>>,
    pacer: Pacer,
}

impl GroqProvider {
    /// One account per usable key. `None` when there is no key.
    ///
    /// The model listing is cached for the catalog refresh interval and bounded by
    /// the catalog request timeout.
    pub fn new(
        config: &GroqConfig,
        worker_replicas: u32,
        attempt_timeout: Duration,
        catalog: &CatalogConfig,
    ) -> Result<Option<Self>, reqwest::Error> {
        let accounts: Vec<Account> = config::usable_keys(&config.api_keys)
            .enumerate()
            .map(|(i, key)| Account::new(GROQ, i, key.clone()))
            .collect();

        if accounts.is_empty() {
            return Ok(None);
        }

        log::debug!("Groq provider configured with {} accounts", accounts.len());

        let refresh_interval = catalog.refresh_interval.max(Duration::from_secs(1));

        Ok(Some(Self {
            http: OpenAiCompatible::new(&config.base_url, HeaderMap::new(), attempt_timeout)?,
            accounts,
            configured_models: config.models.clone().filter(|models| !models.is_empty()),
            listing_timeout: catalog.request_timeout.min(attempt_timeout),
            discovered: Cache::builder().max_capacity(1).time_to_live(refresh_interval).build(),
            failed_listing: Cache::builder()
                .max_capacity(1)
                .time_to_live(refresh_interval.min(RETRY_FAILED_LISTING))
                .build(),
            last_known: RwLock::new(None),
            pacer: Pacer::new(config.min_interval, worker_replicas),
        }))
    }

    async fn discover(&self) -> Vec<String> {
        if let Some(models) = self.discovered.get(&()) {
            return models.as_ref().clone();
        }

        if self.failed_listing.contains_key(&()) {
            return self.fallback().await;
        }

        let Some(account) = self.accounts.first() else {
            return known_models();
        };

        match self.http.list_models(&account.key, self.listing_timeout).await {
            Ok(available) => {
                let ranked = rank_available(&available);

                if ranked.is_empty() {
                    log::warn!("None of the {} Groq models has known limits, using the built-in list", available.len());
                    self.failed_listing.insert((), ());
                    return known_models();
                }

                let ranked = Arc::new(ranked);

                self.discovered.insert((), ranked.clone());
                *self.last_known.write().await = Some(ranked.clone());

                ranked.as_ref().clone()
            }
            Err(e) => {
                log::warn!("Failed to list Groq models, serving the last known list: {e}");
                self.failed_listing.insert((), ());
                self.fallback().await
            }
        }
    }

    /// The last successful listing, or the built-in table.
    async fn fallback(&self) -> Vec<String> {
        match self.last_known.read().await.as_ref() {
            Some(models) => models.as_ref().clone(),
            None => known_models(),
        }
    }
}

/// Known models ordered by tokens per minute, then requests per minute.
fn ranked_limits() -> Vec<(&'static str, u32, u32)> {
    let mut limits = KNOWN_LIMITS.to_vec();
    limits.sort_by(|a, b| b.2.cmp(&a.2).then(b.1.cmp(&a.1)));
    limits
}

fn known_models() -> Vec<String> {
    ranked_limits().into_iter().map(|(id, _, _)| id.to_string()).collect()
}

fn rank_available(available: &[String]) -> Vec<String> {
    ranked_limits()
        .into_iter()
        .filter(|(id, _, _)| available.iter().any(|a| a == id))
        .map(|(id, _, _)| id.to_string())
        .collect()
}

#[async_trait]
impl Provider for GroqProvider {
    fn name(&self) -> &str {
        GROQ
    }

    fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    async fn models(&self) -> Result<Vec<String>, CatalogError> {
        if let Some(models) = &self.configured_models {
            return Ok(models.clone());
        }

        Ok(self.discover().await)
    }

    async fn chat(&self, call: ChatCall<'_>) -> Result<ProviderReply, ProviderFailure> {
        self.pacer.wait(&call.account.bucket_key).await;

        // Groq rejects the `models` array.
        self.http
            .chat(ChatCall {
                fallback_models: &[],
                ..call
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn config(server: &MockServer) -> GroqConfig {
        GroqConfig {
            api_keys: vec![
                SecretString::from("gsk_one".to_string()),
                SecretString::from("  ".to_string()),
                SecretString::from("gsk_two".to_string()),
            ],
            base_url: server.uri(),
            min_interval: Duration::ZERO,
            ..GroqConfig::default()
        }
    }

    fn catalog(refresh_interval: Duration, request_timeout: Duration) -> CatalogConfig {
        CatalogConfig {
            refresh_interval,
            request_timeout,
        }
    }

    fn provider(config: &GroqConfig) -> GroqProvider {
        GroqProvider::new(
            config,
            1,
            Duration::from_secs(5),
            &catalog(Duration::from_secs(3600), Duration::from_secs(5)),
        )
        .unwrap()
        .unwrap()
    }

    const LISTING: &str =
        r#"{"data":[{"id":"llama-3.1-8b-instant"},{"id":"whisper-large-v3"},{"id":"qwen/qwen3-32b"}]}"#;

    #[test]
    fn table_order_is_tpm_then_rpm() {
        insta::assert_debug_snapshot!(known_models(), @r#"
        [
            "meta-llama/llama-4-scout-17b-16e-instruct",
            "llama-3.3-70b-versatile",
            "openai/gpt-oss-20b",
            "openai/gpt-oss-120b",
            "qwen/qwen3-32b",
            "llama-3.1-8b-instant",
            "meta-llama/llama-4-maverick-17b-128e-instruct",
        ]
        "#);
    }

    #[tokio::test]
    async fn blank_keys_are_skipped() {
        let server = MockServer::start().await;
        let provider = provider(&config(&server));

        let labels: Vec<_> = provider.accounts().iter().map(|a| a.label.as_str()).collect();

        assert_eq!(labels, vec!["groq#1", "groq#2"]);
    }

    #[tokio::test]
    async fn no_keys_means_no_provider() {
        let server = MockServer::start().await;

        let config = GroqConfig {
            api_keys: Vec::new(),
            ..config(&server)
        };

        let provider = GroqProvider::new(&config, 1, Duration::from_secs(5), &CatalogConfig::default()).unwrap();

        assert!(provider.is_none());
    }

    #[tokio::test]
    async fn discovered_models_are_intersected_and_cached() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&config(&server));

        let models = provider.models().await.unwrap();
        assert_eq!(models, vec!["qwen/qwen3-32b", "llama-3.1-8b-instant"]);

        assert_eq!(provider.models().await.unwrap(), models);
    }

    #[tokio::test]
    async fn listing_failure_falls_back_to_table() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&config(&server));

        assert_eq!(provider.models().await.unwrap(), known_models());

        // no new listing request until the failure ages out
        assert_eq!(provider.models().await.unwrap(), known_models());
    }

    #[tokio::test]
    async fn slow_listing_is_cut_at_the_catalog_timeout() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(LISTING)
                    .set_delay(Duration::from_secs(10)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = GroqProvider::new(
            &config(&server),
            1,
            Duration::from_secs(60),
            &catalog(Duration::from_secs(3600), Duration::from_millis(200)),
        )
        .unwrap()
        .unwrap();

        let start = std::time::Instant::now();

        assert_eq!(provider.models().await.unwrap(), known_models());
        assert_eq!(provider.models().await.unwrap(), known_models());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_last_listing() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = GroqProvider::new(
            &config(&server),
            1,
            Duration::from_secs(5),
            &catalog(Duration::from_secs(1), Duration::from_secs(5)),
        )
        .unwrap()
        .unwrap();

        let listed = provider.models().await.unwrap();
        assert_eq!(listed, vec!["qwen/qwen3-32b", "llama-3.1-8b-instant"]);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(provider.models().await.unwrap(), listed);
    }

    #[tokio::test]
    async fn configured_models_win() {
        let server = MockServer::start().await;

        let config = GroqConfig {
            models: Some(vec!["custom-model".to_string()]),
            ..config(&server)
        };

        let provider = provider(&config);

        assert_eq!(provider.models().await.unwrap(), vec!["custom-model"]);
    }
}
