use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use config::OpenRouterConfig;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::{Account, ChatCall, OpenAiCompatible, Pacer, Provider, ProviderFailure, ProviderReply};
use crate::{catalog::ModelCatalog, error::CatalogError};

/// Provider name, also the bucket key namespace.
pub const OPENROUTER: &str = "openrouter";

/// OpenRouter, serving free models listed by the catalog.
pub struct OpenRouterProvider {
    http: OpenAiCompatible,
    accounts: Vec<Account>,
    catalog: Arc<dyn ModelCatalog>,
    pacer: Pacer,
}

impl OpenRouterProvider {
    /// One account per usable key. `None` when there is no key.
    pub fn new(
        config: &OpenRouterConfig,
        catalog: Arc<dyn ModelCatalog>,
        worker_replicas: u32,
        attempt_timeout: Duration,
    ) -> Result<Option<Self>, reqwest::Error> {
        let accounts: Vec<Account> = config::usable_keys(&config.api_keys)
            .enumerate()
            .map(|(i, key)| Account::new(OPENROUTER, i, key.clone()))
            .collect();

        if accounts.is_empty() {
            return Ok(None);
        }

        log::debug!("OpenRouter provider configured with {} accounts", accounts.len());

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, "http-referer", config.referer.as_deref());
        insert_header(&mut headers, "x-title", config.title.as_deref());

        Ok(Some(Self {
            http: OpenAiCompatible::new(&config.base_url, headers, attempt_timeout)?,
            accounts,
            catalog,
            pacer: Pacer::new(config.min_interval, worker_replicas),
        }))
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: Option<&str>) {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return;
    };

    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(e) => log::warn!("Ignoring invalid {name} header value: {e}"),
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &str {
        OPENROUTER
    }

    fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    async fn models(&self) -> Result<Vec<String>, CatalogError> {
        let models = self.catalog.free_models().await?;

        Ok(models.into_iter().map(|m| m.id).collect())
    }

    async fn paid_fallbacks(&self, limit: usize) -> Vec<String> {
        match self.catalog.cheapest_paid_models(limit).await {
            Ok(models) => models.into_iter().map(|m| m.id).collect(),
            Err(e) => {
                log::warn!("Failed to list paid fallback models: {e}");
                Vec::new()
            }
        }
    }

    fn supports_fallback_models(&self) -> bool {
        true
    }

    async fn chat(&self, call: ChatCall<'_>) -> Result<ProviderReply, ProviderFailure> {
        self.pacer.wait(&call.account.bucket_key).await;
        self.http.chat(call).await
    }
}
