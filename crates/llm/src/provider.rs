mod groq;
mod openai_compatible;
mod openrouter;
mod pacer;

pub use groq::GroqProvider;
pub use openrouter::OpenRouterProvider;

pub(crate) use openai_compatible::OpenAiCompatible;
pub(crate) use pacer::Pacer;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};

use crate::{error::CatalogError, messages::Usage};

/// Error bodies are cut to this many bytes before they are logged or returned.
const MAX_BODY_SNIPPET: usize = 512;

/// Daily request quota reported by Groq.
const DAILY_LIMIT_HEADER: &str = "x-ratelimit-limit-requests";

/// One API credential of a provider.
#[derive(Clone)]
pub struct Account {
    /// Provider name.
    pub provider: String,
    /// Human readable label, such as `groq#2`.
    pub label: String,
    /// The API key.
    pub key: SecretString,
    /// Limiter bucket of this account. Safe to log.
    pub bucket_key: String,
}

impl Account {
    /// Builds the account and derives its bucket key from the credential.
    pub fn new(provider: &str, index: usize, key: SecretString) -> Self {
        let bucket_key = rate_limit::bucket_key(provider, key.expose_secret());

        Self {
            provider: provider.to_string(),
            label: format!("{provider}#{}", index + 1),
            key,
            bucket_key,
        }
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("provider", &self.provider)
            .field("label", &self.label)
            .field("bucket_key", &self.bucket_key)
            .finish_non_exhaustive()
    }
}

/// Everything one upstream chat attempt needs.
#[derive(Debug, Clone, Copy)]
pub struct ChatCall<'a> {
    /// Account to authenticate as.
    pub account: &'a Account,
    /// Requested model.
    pub model: &'a str,
    /// Alternates the upstream may try on its own.
    pub fallback_models: &'a [String],
    /// System prompt.
    pub system: &'a str,
    /// User prompt.
    pub user: &'a str,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token limit.
    pub max_tokens: u32,
    /// Ask for a server-sent event stream.
    pub stream: bool,
    /// Idle window of a streamed response.
    pub stream_idle_timeout: Duration,
}

/// Rate limit information carried by response headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateSignals {
    /// Parsed `Retry-After`. Zero when the header was invalid or in the past.
    pub retry_after: Option<Duration>,
    /// Requests per day the account may make.
    pub daily_request_limit: Option<i64>,
}

impl RateSignals {
    /// Reads `Retry-After` and the daily quota header.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let retry_after = headers
            .get(RETRY_AFTER)
            .map(|value| parse_retry_after(value.to_str().unwrap_or_default()));

        let daily_request_limit = headers
            .get(DAILY_LIMIT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|limit| *limit > 0);

        Self {
            retry_after,
            daily_request_limit,
        }
    }
}

/// Parses a `Retry-After` value given in seconds or as an HTTP date.
///
/// Invalid values and dates in the past yield zero.
pub fn parse_retry_after(value: &str) -> Duration {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Duration::from_secs(seconds);
    }

    let Ok(date) = jiff::fmt::rfc2822::parse(value) else {
        return Duration::ZERO;
    };

    let seconds = date.timestamp().as_second() - jiff::Timestamp::now().as_second();

    Duration::from_secs(u64::try_from(seconds).unwrap_or_default())
}

/// A chat answer with a 2xx status.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    /// The model that answered, which may differ from the one requested.
    pub model: String,
    /// Content of the first choice. `None` when there were no choices.
    pub content: Option<String>,
    /// Token usage, when reported.
    pub usage: Option<Usage>,
    /// Rate limit headers of the response.
    pub signals: RateSignals,
}

/// How an attempt failed before yielding content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// HTTP 429.
    RateLimited,
    /// Any other 4xx.
    Client {
        /// HTTP status.
        status: u16,
    },
    /// 5xx, transport, decoding or stream failures.
    Server {
        /// HTTP status, if a response arrived.
        status: Option<u16>,
    },
}

/// A failed chat attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    /// Failure class.
    pub class: FailureClass,
    /// Truncated upstream message or local error.
    pub message: String,
    /// Rate limit headers, when a response arrived.
    pub signals: RateSignals,
}

impl ProviderFailure {
    /// A failure without a response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Server { status: None },
            message: message.into(),
            signals: RateSignals::default(),
        }
    }
}

/// An upstream chat provider with one or more accounts.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name, used in bucket keys and logs.
    fn name(&self) -> &str;

    /// Accounts to rotate over.
    fn accounts(&self) -> &[Account];

    /// Candidate models, best first.
    async fn models(&self) -> Result<Vec<String>, CatalogError>;

    /// Paid models to fall back to when every free model is blocked.
    async fn paid_fallbacks(&self, _limit: usize) -> Vec<String> {
        Vec::new()
    }

    /// Whether the upstream accepts a `models` array of alternates.
    fn supports_fallback_models(&self) -> bool {
        false
    }

    /// Performs one chat completion.
    async fn chat(&self, call: ChatCall<'_>) -> Result<ProviderReply, ProviderFailure>;
}

/// Cuts `body` to at most 512 bytes on a character boundary.
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_BODY_SNIPPET {
        return body.to_string();
    }

    let mut end = MAX_BODY_SNIPPET;

    while !body.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &body[..end])
}
