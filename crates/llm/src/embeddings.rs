//! OpenAI embeddings with bounded retries.

use std::time::Duration;

use config::OpenAiConfig;
use reqwest::header::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;

use crate::{
    backoff::{BackoffPolicy, time_left},
    error::DispatchError,
    provider::{FailureClass, OpenAiCompatible},
};

/// Client for `POST {base_url}/embeddings`.
pub(crate) struct Embedder {
    http: OpenAiCompatible,
    key: SecretString,
    model: String,
}

impl Embedder {
    /// `None` when no API key is configured.
    pub(crate) fn from_config(config: &OpenAiConfig, timeout: Duration) -> Result<Option<Self>, reqwest::Error> {
        let Some(key) = config.api_key.clone().filter(|key| !key.expose_secret().trim().is_empty()) else {
            return Ok(None);
        };

        Ok(Some(Self {
            http: OpenAiCompatible::new(&config.base_url, HeaderMap::new(), timeout)?,
            key,
            model: config.embeddings_model.clone(),
        }))
    }

    /// Embeds `texts`, retrying rate limits and server errors until `backoff` runs out.
    pub(crate) async fn embed(&self, texts: &[String], backoff: &BackoffPolicy) -> Result<Vec<Vec<f32>>, DispatchError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let deadline = backoff.deadline(Instant::now());
        let mut delays = backoff.delays();

        loop {
            let failure = match self.http.embeddings(&self.key, &self.model, texts).await {
                Ok(embeddings) => {
                    log::debug!(
                        "Embedded {} texts with {}",
                        embeddings.vectors.len(),
                        if embeddings.model.is_empty() { &self.model } else { &embeddings.model }
                    );

                    return Ok(embeddings.vectors);
                }
                Err(failure) => failure,
            };

            let wait = match failure.class {
                FailureClass::Client { status } => {
                    return Err(DispatchError::Embedding(format!("status {status}: {}", failure.message)));
                }
                FailureClass::RateLimited => failure.signals.retry_after.filter(|d| !d.is_zero()).or_else(|| delays.next()),
                FailureClass::Server { .. } => delays.next(),
            };

            let (Some(wait), Some(left)) = (wait, time_left(deadline)) else {
                return Err(DispatchError::Embedding(failure.message));
            };

            if wait > left {
                return Err(DispatchError::Embedding(failure.message));
            }

            log::warn!("Embedding request failed, retrying in {wait:?}: {}", failure.message);

            tokio::time::sleep(wait).await;
        }
    }
}
