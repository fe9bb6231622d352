use std::fmt;

use thiserror::Error;

/// The model catalog could not be read.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    /// The request did not complete.
    #[error("Model list request failed: {0}")]
    Connection(String),

    /// The upstream answered with an error status.
    #[error("Model list request failed with status {status}: {message}")]
    Status {
        /// HTTP status.
        status: u16,
        /// Truncated response body.
        message: String,
    },

    /// The body was not a model list.
    #[error("Failed to decode model list: {0}")]
    Decode(String),
}

/// Errors surfaced by the dispatch layer. Failures of single candidates are
/// absorbed; only these reach the caller.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No provider has a usable account.
    #[error("No chat provider accounts are configured")]
    NoProviders,

    /// The dispatch layer could not be built from its configuration.
    #[error("Invalid dispatch configuration: {0}")]
    Configuration(String),

    /// No candidate could be planned because the catalog failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Every candidate failed.
    #[error("All candidates failed ({} attempts)", .attempts.len())]
    AllCandidatesExhausted {
        /// One entry per failed attempt, in order.
        attempts: Vec<AttemptFailure>,
    },

    /// The caller gave up.
    #[error("Dispatch canceled")]
    Canceled,

    /// The embeddings call failed.
    #[error("Embedding request failed: {0}")]
    Embedding(String),
}

impl DispatchError {
    /// Whether the caller canceled, as opposed to the providers failing.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// One failed attempt against a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Provider name.
    pub provider: String,
    /// Requested model.
    pub model: String,
    /// Bucket key of the account.
    pub account: String,
    /// What went wrong.
    pub kind: FailureKind,
    /// Details for logs.
    pub detail: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} via {}: {} ({})",
            self.provider, self.model, self.account, self.kind, self.detail
        )
    }
}

/// Failure taxonomy of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The shared limiter denied the account.
    LimiterDenied,
    /// The upstream answered 429 or signaled an exhausted quota.
    RateLimited,
    /// 4xx other than 429.
    ClientError,
    /// 5xx, network, decoding, timeout or an empty response.
    ServerError,
    /// The content was a refusal or too poor to use.
    RefusalOrLowQuality,
    /// The account was cooling down.
    Blocked,
}

impl FailureKind {
    /// Stable snake case label, used as a metric attribute.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LimiterDenied => "limiter_denied",
            Self::RateLimited => "rate_limited",
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
            Self::RefusalOrLowQuality => "refusal_or_low_quality",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LimiterDenied => "limiter denied",
            Self::RateLimited => "rate limited",
            Self::ClientError => "client error",
            Self::ServerError => "server error",
            Self::RefusalOrLowQuality => "refusal or low quality",
            Self::Blocked => "account blocked",
        };

        f.write_str(name)
    }
}
