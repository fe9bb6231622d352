//! Chat dispatch across providers, accounts and models.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use config::Config;
use rate_limit::{BucketConfig, TokenBucketLimiter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::{BackoffPolicy, time_left},
    blocks::{AccountBlockRegistry, DEFAULT_BLOCK},
    catalog::{ModelCatalog, OpenRouterCatalog},
    embeddings::Embedder,
    error::{AttemptFailure, CatalogError, DispatchError, FailureKind},
    messages::Usage,
    metrics::DispatchMetrics,
    model_health::ModelHealth,
    provider::{Account, ChatCall, GroqProvider, OpenRouterProvider, Provider, ProviderFailure, ProviderReply},
    quality::{Outcome, QualityPolicy, classify},
};

/// Prompts of one chat request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPrompt {
    /// System instructions.
    pub system: String,
    /// User message.
    pub user: String,
    /// Completion budget. The configured default applies when unset.
    pub max_tokens: Option<u32>,
}

/// A successful chat completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// The completion text.
    pub content: String,
    /// Provider that answered.
    pub provider: String,
    /// Model that was requested.
    pub requested_model: String,
    /// Model that actually answered.
    pub model: String,
    /// Token usage, when reported.
    pub usage: Option<Usage>,
}

/// Tunables of the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Upper bound on planned candidates.
    pub max_candidates: usize,
    /// Alternates sent upstream with each call.
    pub max_fallback_models: usize,
    /// Attempts per candidate on server errors.
    pub max_attempts_per_candidate: u32,
    /// Timeout of one upstream attempt.
    pub attempt_timeout: Duration,
    /// Idle window of streamed responses.
    pub stream_idle_timeout: Duration,
    /// Request streamed responses.
    pub stream: bool,
    /// Sampling temperature.
    pub temperature: f32,
    /// Default completion budget.
    pub max_tokens: u32,
    /// Delays and the overall time budget.
    pub backoff: BackoffPolicy,
    /// Refusal and low-quality rules.
    pub quality: QualityPolicy,
}

impl DispatchSettings {
    /// Reads the dispatch section and resolves environment presets.
    pub fn from_config(config: &Config) -> Self {
        let dispatch = &config.dispatch;

        Self {
            max_candidates: dispatch.max_candidates,
            max_fallback_models: dispatch.max_fallback_models,
            max_attempts_per_candidate: dispatch.max_attempts_per_candidate.max(1),
            attempt_timeout: dispatch.attempt_timeout,
            stream_idle_timeout: dispatch.stream_idle_timeout,
            stream: config.streaming_enabled(),
            temperature: dispatch.temperature,
            max_tokens: dispatch.max_tokens,
            backoff: config.backoff().into(),
            quality: QualityPolicy::from(&dispatch.quality),
        }
    }
}

/// One (provider, account, model) combination.
#[derive(Clone)]
pub(crate) struct Candidate {
    provider: Arc<dyn Provider>,
    account: Account,
    model: String,
    fallback_models: Vec<String>,
}

impl Candidate {
    fn failure(&self, kind: FailureKind, detail: impl Into<String>) -> AttemptFailure {
        AttemptFailure {
            provider: self.provider.name().to_string(),
            model: self.model.clone(),
            account: self.account.bucket_key.clone(),
            kind,
            detail: detail.into(),
        }
    }
}

enum CandidateResult {
    Done(Completion),
    /// The limiter denied the account. Worth another try once the instant passes.
    Deferred(Instant),
    Failed,
}

/// Makes one successful chat call per request, rotating over every configured
/// provider account and model until one produces usable content.
pub struct DispatchClient {
    settings: DispatchSettings,
    limiter: Arc<TokenBucketLimiter>,
    providers: Vec<Arc<dyn Provider>>,
    catalog: Option<Arc<dyn ModelCatalog>>,
    embedder: Option<Embedder>,
    blocks: AccountBlockRegistry,
    health: ModelHealth,
    metrics: DispatchMetrics,
    rotation: AtomicUsize,
}

impl DispatchClient {
    /// Creates a client over already built providers.
    pub fn new(
        settings: DispatchSettings,
        limiter: Arc<TokenBucketLimiter>,
        providers: Vec<Arc<dyn Provider>>,
        catalog: Option<Arc<dyn ModelCatalog>>,
    ) -> Self {
        Self {
            settings,
            limiter,
            providers,
            catalog,
            embedder: None,
            blocks: AccountBlockRegistry::new(),
            health: ModelHealth::new(),
            metrics: DispatchMetrics::new(),
            rotation: AtomicUsize::new(0),
        }
    }

    /// Builds providers, the catalog and embeddings from configuration, and
    /// seeds per-account buckets from provider request rates.
    pub async fn from_config(config: &Config, limiter: Arc<TokenBucketLimiter>) -> Result<Self, DispatchError> {
        let settings = DispatchSettings::from_config(config);
        let dispatch = &config.dispatch;
        let http_error = |e: reqwest::Error| DispatchError::Configuration(format!("Failed to build HTTP client: {e}"));

        let catalog: Option<Arc<dyn ModelCatalog>> = match &config.providers.openrouter {
            Some(openrouter) => {
                let key = config::usable_keys(&openrouter.api_keys).next().cloned();

                let catalog = OpenRouterCatalog::new(
                    openrouter.base_url.clone(),
                    key,
                    config.catalog.refresh_interval,
                    config.catalog.request_timeout,
                )
                .map_err(http_error)?;

                Some(Arc::new(catalog))
            }
            None => None,
        };

        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

        for name in &dispatch.provider_order {
            let provider: Option<Arc<dyn Provider>> = match name.as_str() {
                "groq" => match &config.providers.groq {
                    Some(groq) => GroqProvider::new(groq, dispatch.worker_replicas, dispatch.attempt_timeout, &config.catalog)
                    .map_err(http_error)?
                    .map(|p| Arc::new(p) as Arc<dyn Provider>),
                    None => None,
                },
                "openrouter" => match (&config.providers.openrouter, &catalog) {
                    (Some(openrouter), Some(catalog)) => OpenRouterProvider::new(
                        openrouter,
                        catalog.clone(),
                        dispatch.worker_replicas,
                        dispatch.attempt_timeout,
                    )
                    .map_err(http_error)?
                    .map(|p| Arc::new(p) as Arc<dyn Provider>),
                    _ => None,
                },
                other => {
                    log::warn!("Ignoring unknown provider '{other}' in dispatch.provider_order");
                    None
                }
            };

            match provider {
                Some(provider) => providers.push(provider),
                None => log::debug!("Provider '{name}' has no usable accounts"),
            }
        }

        if providers.is_empty() {
            return Err(DispatchError::NoProviders);
        }

        let seeds = [
            (
                "groq",
                config.providers.groq.as_ref().and_then(|c| c.requests_per_minute),
            ),
            (
                "openrouter",
                config.providers.openrouter.as_ref().and_then(|c| c.requests_per_minute),
            ),
        ];

        for provider in &providers {
            let rpm = seeds
                .iter()
                .find(|(name, _)| *name == provider.name())
                .and_then(|(_, rpm)| *rpm);

            let Some(rpm) = rpm else { continue };

            for account in provider.accounts() {
                if limiter.bucket_config(&account.bucket_key).await.is_none() {
                    limiter
                        .set_bucket_config(account.bucket_key.clone(), BucketConfig::from_per_minute(i64::from(rpm)))
                        .await;
                }
            }
        }

        let embedder = match &config.providers.openai {
            Some(openai) => Embedder::from_config(openai, dispatch.attempt_timeout).map_err(http_error)?,
            None => None,
        };

        let mut client = Self::new(settings, limiter, providers, catalog);
        client.embedder = embedder;

        Ok(client)
    }

    /// The free model catalog, when OpenRouter is configured.
    pub fn catalog(&self) -> Option<&Arc<dyn ModelCatalog>> {
        self.catalog.as_ref()
    }

    /// The shared limiter.
    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.limiter
    }

    /// Runs one chat request to completion, or until every candidate failed or
    /// `cancel` fired.
    pub async fn chat(&self, prompt: &ChatPrompt, cancel: &CancellationToken) -> Result<Completion, DispatchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("Chat dispatch canceled by caller");
                Err(DispatchError::Canceled)
            }
            result = self.dispatch(prompt) => result,
        }
    }

    /// Embeds `texts` with the OpenAI embeddings API.
    pub async fn embed(&self, texts: &[String], cancel: &CancellationToken) -> Result<Vec<Vec<f32>>, DispatchError> {
        let Some(embedder) = &self.embedder else {
            return Err(DispatchError::Embedding(
                "No OpenAI API key is configured for embeddings".to_string(),
            ));
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Canceled),
            result = embedder.embed(texts, &self.settings.backoff) => result,
        }
    }

    async fn dispatch(&self, prompt: &ChatPrompt) -> Result<Completion, DispatchError> {
        let deadline = self.settings.backoff.deadline(Instant::now());
        let candidates = self.plan_within(deadline).await?;

        log::debug!("Planned {} chat candidates", candidates.len());

        let mut attempts = Vec::new();
        let mut deferred = Vec::new();

        for candidate in candidates {
            if time_left(deadline).is_none() {
                break;
            }

            match self.run_candidate(&candidate, prompt, deadline, &mut attempts).await {
                CandidateResult::Done(completion) => return Ok(completion),
                CandidateResult::Deferred(ready_at) => deferred.push((ready_at, candidate)),
                CandidateResult::Failed => {}
            }
        }

        deferred.sort_by_key(|(ready_at, _)| *ready_at);

        for (ready_at, candidate) in deferred {
            if ready_at >= deadline {
                log::debug!(
                    "Not waiting for {}, its tokens refill after the time budget ends",
                    candidate.account.bucket_key
                );
                break;
            }

            tokio::time::sleep_until(ready_at).await;

            if let CandidateResult::Done(completion) =
                self.run_candidate(&candidate, prompt, deadline, &mut attempts).await
            {
                return Ok(completion);
            }
        }

        log::warn!("All {} chat attempts failed", attempts.len());

        for attempt in &attempts {
            log::debug!("Failed attempt: {attempt}");
        }

        Err(DispatchError::AllCandidatesExhausted { attempts })
    }

    /// Plans candidates, giving up when model listing outlives the time budget.
    async fn plan_within(&self, deadline: Instant) -> Result<Vec<Candidate>, DispatchError> {
        let budget = time_left(deadline).unwrap_or_default();

        match tokio::time::timeout(budget, self.plan()).await {
            Ok(planned) => planned,
            Err(_) => {
                log::warn!("Model listing did not finish within {budget:?}");

                Err(DispatchError::Catalog(CatalogError::Connection(format!(
                    "Model listing did not finish within {budget:?}"
                ))))
            }
        }
    }

    /// Orders candidates: providers in configured order, models by health with
    /// a per-call rotation, accounts round-robin.
    pub(crate) async fn plan(&self) -> Result<Vec<Candidate>, DispatchError> {
        let offset = self.rotation.fetch_add(1, Ordering::Relaxed);
        let mut candidates = Vec::new();
        let mut catalog_error: Option<CatalogError> = None;

        for provider in &self.providers {
            let accounts = provider.accounts();

            if accounts.is_empty() {
                continue;
            }

            let models = match provider.models().await {
                Ok(models) => models,
                Err(e) => {
                    log::warn!("No models from {}: {e}", provider.name());
                    catalog_error = Some(e);
                    continue;
                }
            };

            if models.is_empty() {
                continue;
            }

            let mut ordered = self.health.order(&models, offset);

            if self.health.all_blocked(&models) {
                let paid = provider.paid_fallbacks(self.settings.max_fallback_models).await;

                if !paid.is_empty() {
                    log::info!(
                        "Every {} model is blocked, trying {} paid models first",
                        provider.name(),
                        paid.len()
                    );

                    ordered = paid.into_iter().chain(ordered).collect();
                }
            }

            let fallback_limit = if provider.supports_fallback_models() {
                self.settings.max_fallback_models
            } else {
                0
            };

            for (i, model) in ordered.iter().enumerate() {
                let account = accounts[(offset + i) % accounts.len()].clone();

                candidates.push(Candidate {
                    provider: provider.clone(),
                    account,
                    model: model.clone(),
                    fallback_models: ordered.iter().skip(i + 1).take(fallback_limit).cloned().collect(),
                });
            }
        }

        candidates.truncate(self.settings.max_candidates);

        if candidates.is_empty() {
            return Err(match catalog_error {
                Some(e) => DispatchError::Catalog(e),
                None => DispatchError::NoProviders,
            });
        }

        Ok(candidates)
    }

    async fn run_candidate(
        &self,
        candidate: &Candidate,
        prompt: &ChatPrompt,
        deadline: Instant,
        attempts: &mut Vec<AttemptFailure>,
    ) -> CandidateResult {
        let account = &candidate.account;
        let mut delays = self.settings.backoff.delays();

        for attempt in 1..=self.settings.max_attempts_per_candidate {
            if let Some(remaining) = self.blocks.remaining(&account.bucket_key) {
                self.reject(candidate, attempts, FailureKind::Blocked, format!("blocked for {remaining:?}"));
                return CandidateResult::Failed;
            }

            let admission = self.limiter.allow(&account.bucket_key, 1).await;

            if let Some(e) = &admission.error {
                log::warn!("Proceeding without rate limiting for {}: {e}", account.bucket_key);
            }

            if !admission.allowed {
                log::debug!(
                    "Limiter denied {} for {:?}, rotating",
                    account.bucket_key,
                    admission.retry_after
                );

                self.reject(
                    candidate,
                    attempts,
                    FailureKind::LimiterDenied,
                    format!("retry after {:?}", admission.retry_after),
                );

                let ready_at = Instant::now().checked_add(admission.retry_after).unwrap_or(deadline);

                return CandidateResult::Deferred(ready_at);
            }

            let Some(left) = time_left(deadline) else {
                return CandidateResult::Failed;
            };

            let provider = candidate.provider.name();
            let recorder = self.metrics.operation(provider, &candidate.model);

            let result = self.call(candidate, prompt, self.settings.attempt_timeout.min(left)).await;
            self.ingest_signals(account, &result).await;

            let outcome = classify(result, &self.settings.quality);
            self.metrics.finish_operation(recorder, provider, &candidate.model, &outcome);

            let (detail, status) = match outcome {
                Outcome::Success { content, model, usage } => {
                    self.health.record_success(&candidate.model);
                    self.metrics.count_attempt(provider, &candidate.model, None);

                    if model != candidate.model {
                        log::warn!(
                            "{} answered with {model} instead of {}",
                            provider,
                            candidate.model
                        );
                    }

                    log::info!(
                        "Chat completed by {}/{model} via {}",
                        provider,
                        account.bucket_key
                    );

                    return CandidateResult::Done(Completion {
                        content,
                        provider: provider.to_string(),
                        requested_model: candidate.model.clone(),
                        model,
                        usage,
                    });
                }
                Outcome::Refusal { category } => {
                    log::warn!("{} refused the request ({category}), rotating", candidate.model);
                    self.health.record_failure(&candidate.model);
                    self.reject(candidate, attempts, FailureKind::RefusalOrLowQuality, format!("refusal: {category}"));

                    return CandidateResult::Failed;
                }
                Outcome::LowQuality(reason) => {
                    log::warn!("{} gave a low quality answer ({reason}), rotating", candidate.model);
                    self.health.record_failure(&candidate.model);
                    self.reject(candidate, attempts, FailureKind::RefusalOrLowQuality, format!("low quality: {reason}"));

                    return CandidateResult::Failed;
                }
                Outcome::RateLimited { retry_after } => {
                    let wait = retry_after.filter(|d| !d.is_zero()).unwrap_or(DEFAULT_BLOCK);

                    log::warn!(
                        "{} rate limited {} on {}, blocking for {wait:?}",
                        provider,
                        account.bucket_key,
                        candidate.model
                    );

                    self.limiter
                        .set_bucket_config(account.bucket_key.clone(), BucketConfig::after_retry(wait))
                        .await;

                    self.blocks.block(&account.bucket_key, wait);
                    self.health.record_rate_limit(&candidate.model, retry_after);
                    self.reject(candidate, attempts, FailureKind::RateLimited, format!("retry after {wait:?}"));

                    return CandidateResult::Failed;
                }
                Outcome::ClientError { status, message } => {
                    log::warn!("{} rejected {} with {status}: {message}", provider, candidate.model);
                    self.health.record_failure(&candidate.model);
                    self.reject(candidate, attempts, FailureKind::ClientError, format!("{status}: {message}"));

                    return CandidateResult::Failed;
                }
                Outcome::ServerError { status, message } => (message, status),
            };

            log::warn!(
                "{} failed on {} (attempt {attempt}, status {status:?}): {detail}",
                provider,
                candidate.model
            );

            self.health.record_failure(&candidate.model);
            self.reject(candidate, attempts, FailureKind::ServerError, detail);

            if attempt == self.settings.max_attempts_per_candidate {
                break;
            }

            let (Some(delay), Some(left)) = (delays.next(), time_left(deadline)) else {
                break;
            };

            tokio::time::sleep(delay.min(left)).await;
        }

        CandidateResult::Failed
    }

    fn reject(&self, candidate: &Candidate, attempts: &mut Vec<AttemptFailure>, kind: FailureKind, detail: String) {
        self.metrics.count_attempt(candidate.provider.name(), &candidate.model, Some(kind));

        attempts.push(candidate.failure(kind, detail));
    }

    async fn call(
        &self,
        candidate: &Candidate,
        prompt: &ChatPrompt,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderFailure> {
        let call = ChatCall {
            account: &candidate.account,
            model: &candidate.model,
            fallback_models: &candidate.fallback_models,
            system: &prompt.system,
            user: &prompt.user,
            temperature: self.settings.temperature,
            max_tokens: prompt.max_tokens.unwrap_or(self.settings.max_tokens),
            stream: self.settings.stream,
            stream_idle_timeout: self.settings.stream_idle_timeout,
        };

        match tokio::time::timeout(timeout, candidate.provider.chat(call)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderFailure::transport(format!("Attempt timed out after {timeout:?}"))),
        }
    }

    /// Pre-configures the account bucket from a daily quota header.
    async fn ingest_signals(&self, account: &Account, result: &Result<ProviderReply, ProviderFailure>) {
        let signals = match result {
            Ok(reply) => reply.signals,
            Err(failure) => failure.signals,
        };

        let Some(limit) = signals.daily_request_limit else {
            return;
        };

        let config = BucketConfig::per_day(limit);

        if self.limiter.bucket_config(&account.bucket_key).await != Some(config) {
            log::info!("Account {} allows {limit} requests per day", account.bucket_key);
            self.limiter.set_bucket_config(account.bucket_key.clone(), config).await;
        }
    }
}
