//! Token bucket policy, state and key derivation.

use std::time::Duration;

use sha2::{Digest, Sha256};

const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

/// Capacity and refill rate of one token bucket.
///
/// A bucket with a non-positive capacity or refill rate is unconfigured and
/// every admission check against it is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BucketConfig {
    /// Maximum number of tokens the bucket holds.
    pub capacity: i64,
    /// Tokens added per second.
    pub refill_rate: f64,
}

impl BucketConfig {
    /// Creates a bucket with explicit dimensions.
    pub fn new(capacity: i64, refill_rate: f64) -> Self {
        Self { capacity, refill_rate }
    }

    /// `n` requests per minute. A non-positive `n` yields an unconfigured bucket.
    pub fn from_per_minute(n: i64) -> Self {
        if n <= 0 {
            return Self::default();
        }

        Self::new(n, n as f64 / 60.0)
    }

    /// `n` requests per day, as reported by daily quota headers.
    pub fn per_day(n: i64) -> Self {
        if n <= 0 {
            return Self::default();
        }

        Self::new(n, n as f64 / SECONDS_PER_DAY)
    }

    /// One request per `retry_after`, used after the upstream answered 429.
    pub fn after_retry(retry_after: Duration) -> Self {
        let seconds = retry_after.as_secs_f64();

        if seconds <= 0.0 {
            return Self::default();
        }

        Self::new(1, 1.0 / seconds)
    }

    /// Whether the bucket enforces anything at all.
    pub fn is_configured(&self) -> bool {
        self.capacity > 0 && self.refill_rate > 0.0
    }
}

impl From<config::BucketPolicy> for BucketConfig {
    fn from(policy: config::BucketPolicy) -> Self {
        Self::new(policy.capacity(), policy.refill_rate())
    }
}

/// Live token count of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens currently available.
    pub tokens: f64,
    /// Seconds since the Unix epoch of the last refill.
    pub last_refill: f64,
}

/// A bucket state together with its key and policy, as stored in the durable mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSnapshot {
    /// Bucket key.
    pub key: String,
    /// Policy in effect when the snapshot was taken.
    pub config: BucketConfig,
    /// Token count at `state.last_refill`.
    pub state: BucketState,
}

/// Result of one refill and consume step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeOutcome {
    /// Whether the requested cost was consumed.
    pub allowed: bool,
    /// State written back to the store.
    pub state: BucketState,
    /// Seconds until the missing tokens have been refilled. Zero when allowed.
    pub retry_after_secs: f64,
}

/// Refills the bucket up to `now` and tries to consume `cost` tokens.
///
/// `state` is `None` for a bucket seen for the first time, which starts full.
/// The returned state is written back whether or not the request was allowed.
pub fn refill_and_take(state: Option<BucketState>, config: BucketConfig, now: f64, cost: f64) -> TakeOutcome {
    let capacity = config.capacity as f64;

    let BucketState { tokens, last_refill } = state.unwrap_or(BucketState {
        tokens: capacity,
        last_refill: now,
    });

    let delta = (now - last_refill).max(0.0);
    let mut tokens = capacity.min(tokens + delta * config.refill_rate);

    let (allowed, retry_after_secs) = if tokens >= cost {
        tokens -= cost;
        (true, 0.0)
    } else if config.refill_rate > 0.0 {
        (false, (cost - tokens) / config.refill_rate)
    } else {
        (false, 0.0)
    };

    TakeOutcome {
        allowed,
        state: BucketState {
            tokens,
            last_refill: now,
        },
        retry_after_secs,
    }
}

/// Derives the bucket key of a provider account.
///
/// The credential is hashed, so the key can be logged and stored without
/// exposing the secret.
pub fn bucket_key(provider: &str, credential: &str) -> String {
    let credential = credential.trim();

    if credential.is_empty() {
        return format!("{provider}:default");
    }

    let digest = Sha256::digest(credential.as_bytes());

    format!("{provider}:{}", hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_minute_policy() {
        let config = BucketConfig::from_per_minute(30);

        assert_eq!(config.capacity, 30);
        assert_eq!(config.refill_rate, 0.5);
        assert!(config.is_configured());
        assert!(!BucketConfig::from_per_minute(0).is_configured());
        assert!(!BucketConfig::from_per_minute(-5).is_configured());
    }

    #[test]
    fn per_day_policy() {
        let config = BucketConfig::per_day(14_400);

        assert_eq!(config.capacity, 14_400);
        assert!((config.refill_rate - 14_400.0 / 86_400.0).abs() < f64::EPSILON);
    }

    #[test]
    fn after_retry_policy() {
        let config = BucketConfig::after_retry(Duration::from_secs(4));

        assert_eq!(config, BucketConfig::new(1, 0.25));
        assert!(!BucketConfig::after_retry(Duration::ZERO).is_configured());
    }

    #[test]
    fn new_bucket_starts_full() {
        let config = BucketConfig::new(3, 1.0);
        let outcome = refill_and_take(None, config, 100.0, 1.0);

        assert!(outcome.allowed);
        assert_eq!(outcome.state.tokens, 2.0);
        assert_eq!(outcome.state.last_refill, 100.0);
        assert_eq!(outcome.retry_after_secs, 0.0);
    }

    #[test]
    fn denial_reports_shortage_over_refill_rate() {
        let config = BucketConfig::new(2, 0.5);
        let state = BucketState {
            tokens: 0.25,
            last_refill: 10.0,
        };

        let outcome = refill_and_take(Some(state), config, 10.0, 1.0);

        assert!(!outcome.allowed);
        assert_eq!(outcome.state.tokens, 0.25);
        assert_eq!(outcome.retry_after_secs, 1.5);
    }

    #[test]
    fn refill_is_clamped_to_capacity() {
        let config = BucketConfig::new(5, 1.0);
        let state = BucketState {
            tokens: 0.0,
            last_refill: 0.0,
        };

        let outcome = refill_and_take(Some(state), config, 1_000.0, 1.0);

        assert!(outcome.allowed);
        assert_eq!(outcome.state.tokens, 4.0);
    }

    #[test]
    fn clock_skew_does_not_drain_the_bucket() {
        let config = BucketConfig::new(5, 1.0);
        let state = BucketState {
            tokens: 2.0,
            last_refill: 50.0,
        };

        let outcome = refill_and_take(Some(state), config, 40.0, 1.0);

        assert!(outcome.allowed);
        assert_eq!(outcome.state.tokens, 1.0);
        assert_eq!(outcome.state.last_refill, 40.0);
    }

    #[test]
    fn bucket_key_hides_the_credential() {
        let key = bucket_key("openrouter", "  sk-or-v1-secret  ");

        assert!(key.starts_with("openrouter:"));
        assert_eq!(key.len(), "openrouter:".len() + 16);
        assert!(!key.contains("secret"));
        assert_eq!(key, bucket_key("openrouter", "sk-or-v1-secret"));
        assert_ne!(key, bucket_key("groq", "sk-or-v1-secret"));
    }

    #[test]
    fn empty_credential_uses_default_key() {
        assert_eq!(bucket_key("groq", ""), "groq:default");
        assert_eq!(bucket_key("groq", "   "), "groq:default");
    }
}
