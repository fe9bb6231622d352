use std::{sync::Arc, time::Duration};

use config::Config;
use llm::{ChatPrompt, DispatchClient, ModelCatalog, OpenRouterCatalog};
use rate_limit::TokenBucketLimiter;
use tokio_util::sync::CancellationToken;

/// How long a command waits for rate limit mirror writes before exiting.
const MIRROR_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn chat(config: &Config, prompt: ChatPrompt) -> anyhow::Result<()> {
    config.validate()?;

    let limiter = Arc::new(TokenBucketLimiter::from_config(&config.rate_limit).await?);
    let client = DispatchClient::from_config(config, limiter).await?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, canceling the dispatch");
            on_interrupt.cancel();
        }
    });

    let result = client.chat(&prompt, &cancel).await;
    client.limiter().flush_mirror(MIRROR_FLUSH_TIMEOUT).await;

    let completion = result?;

    log::info!(
        "Answered by {}/{} (requested {})",
        completion.provider,
        completion.model,
        completion.requested_model
    );

    if let Some(usage) = completion.usage {
        log::info!(
            "Used {} prompt and {} completion tokens",
            usage.prompt_tokens,
            usage.completion_tokens
        );
    }

    println!("{}", completion.content);

    Ok(())
}

pub(crate) async fn models(config: &Config, paid: usize) -> anyhow::Result<()> {
    let Some(openrouter) = &config.providers.openrouter else {
        anyhow::bail!("OpenRouter is not configured");
    };

    let catalog = OpenRouterCatalog::new(
        openrouter.base_url.clone(),
        config::usable_keys(&openrouter.api_keys).next().cloned(),
        config.catalog.refresh_interval,
        config.catalog.request_timeout,
    )?;

    for model in catalog.free_models().await? {
        println!("{}\t{:.0}\t{}", model.id, model.context_length, model.name);
    }

    if paid > 0 {
        for model in catalog.cheapest_paid_models(paid).await? {
            println!("{}\t{}\t(paid)", model.id, model.effective_price());
        }
    }

    Ok(())
}

pub(crate) async fn warm(config: &Config) -> anyhow::Result<()> {
    if config.rate_limit.mirror.is_none() {
        anyhow::bail!("No rate limit mirror is configured");
    }

    let mut rate_limit = config.rate_limit.clone();

    // Warm explicitly below instead of during construction.
    if let Some(mirror) = &mut rate_limit.mirror {
        mirror.warm_start = false;
    }

    let limiter = TokenBucketLimiter::from_config(&rate_limit).await?;
    let restored = limiter.warm_start().await?;

    println!("{restored}");

    Ok(())
}

pub(crate) async fn allow(config: &Config, bucket_key: &str, cost: i64) -> anyhow::Result<()> {
    let limiter = TokenBucketLimiter::from_config(&config.rate_limit).await?;

    if limiter.bucket_config(bucket_key).await.is_none() {
        log::warn!("Bucket '{bucket_key}' has no policy, the admission is unlimited");
    }

    let admission = limiter.allow(bucket_key, cost).await;
    limiter.flush_mirror(MIRROR_FLUSH_TIMEOUT).await;

    if let Some(e) = &admission.error {
        log::warn!("Admission fell back to allow: {e}");
    }

    match admission.tokens {
        Some(tokens) => println!(
            "allowed={} retry_after={:?} tokens={tokens:.3}",
            admission.allowed, admission.retry_after
        ),
        None => println!("allowed={} retry_after={:?}", admission.allowed, admission.retry_after),
    }

    Ok(())
}
