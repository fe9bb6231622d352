//! Resilient chat dispatch over free-tier LLM providers.
//!
//! A [`DispatchClient`] turns one chat request into exactly one successful
//! upstream call. It plans candidates across every configured provider account
//! and model, consults the shared [`rate_limit::TokenBucketLimiter`] before
//! each attempt, and rotates on rate limits, server errors, refusals and
//! low-quality answers until one candidate produces usable content or the
//! backoff budget runs out.
//!
//! Providers speak the OpenAI chat completions protocol. OpenRouter's free
//! models come from the [`OpenRouterCatalog`], Groq's from its model listing
//! intersected with known free-tier limits.

#![deny(missing_docs)]

mod backoff;
mod blocks;
mod catalog;
mod client;
mod embeddings;
mod error;
mod messages;
mod metrics;
mod model_health;
mod provider;
mod quality;
mod sse;

pub use backoff::BackoffPolicy;
pub use blocks::AccountBlockRegistry;
pub use catalog::{ModelCatalog, ModelDescriptor, OpenRouterCatalog, PerRequestLimits, Pricing, parse_price};
pub use client::{ChatPrompt, Completion, DispatchClient, DispatchSettings};
pub use error::{AttemptFailure, CatalogError, DispatchError, FailureKind};
pub use messages::Usage;
pub use model_health::ModelHealth;
pub use provider::{
    Account, ChatCall, FailureClass, GroqProvider, OpenRouterProvider, Provider, ProviderFailure, ProviderReply,
    RateSignals, parse_retry_after,
};
pub use quality::{LowQuality, Outcome, QualityPolicy, classify};
pub use sse::{DEFAULT_IDLE_TIMEOUT, StreamError, read_chat_stream};
