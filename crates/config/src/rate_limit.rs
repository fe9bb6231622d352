//! Distributed rate limiter configuration structures.

use std::{collections::BTreeMap, time::Duration};

use duration_str::{deserialize_duration, deserialize_option_duration};
use secrecy::SecretString;
use serde::Deserialize;

/// Rate limiter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Storage backend holding the live token counts.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Durable mirror used to warm-start the live store after a deploy.
    #[serde(default)]
    pub mirror: Option<MirrorConfig>,
    /// Bucket policies keyed by bucket key, installed at startup.
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketPolicy>,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-process storage (default). Only consistent within one process.
    #[default]
    Memory,
    /// Redis storage shared by every worker process.
    Redis(Box<RedisConfig>),
    /// No store. Every admission check is allowed.
    Disabled,
}

/// Redis storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Redis connection URL (redis:// or rediss:// for TLS).
    pub url: String,
    /// Connection pool configuration.
    #[serde(default)]
    pub pool: RedisPoolConfig,
    /// TLS configuration.
    pub tls: Option<RedisTlsConfig>,
    /// Prefix of every bucket hash key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Response timeout for Redis commands.
    #[serde(
        default = "default_response_timeout",
        deserialize_with = "deserialize_option_duration"
    )]
    pub response_timeout: Option<Duration>,
}

fn default_key_prefix() -> String {
    "rate:".to_string()
}

fn default_response_timeout() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

/// Redis connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisPoolConfig {
    /// Maximum number of connections.
    pub max_size: Option<usize>,
    /// Minimum number of idle connections.
    pub min_idle: Option<usize>,
    /// Timeout for creating connections.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_create: Option<Duration>,
    /// Timeout for waiting for a connection.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_wait: Option<Duration>,
    /// Timeout before recycling idle connections.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout_recycle: Option<Duration>,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: Some(16),
            min_idle: Some(0),
            timeout_create: Some(Duration::from_secs(5)),
            timeout_wait: Some(Duration::from_secs(5)),
            timeout_recycle: Some(Duration::from_secs(300)),
        }
    }
}

/// Redis TLS configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisTlsConfig {
    /// Enable TLS (automatically enabled for rediss:// URLs).
    pub enabled: bool,
    /// Allow insecure connections (skip certificate validation).
    pub insecure: Option<bool>,
    /// Path to CA certificate file.
    pub ca_cert_path: Option<String>,
    /// Path to client certificate file (for mutual TLS).
    pub client_cert_path: Option<String>,
    /// Path to client key file (for mutual TLS).
    pub client_key_path: Option<String>,
}

/// Postgres mirror of the bucket states.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    /// Postgres connection URL.
    pub url: SecretString,
    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Timeout for acquiring a pooled connection.
    #[serde(default = "default_acquire_timeout", deserialize_with = "deserialize_duration")]
    pub acquire_timeout: Duration,
    /// Load the mirrored states into the live store at startup.
    #[serde(default = "default_true")]
    pub warm_start: bool,
    /// Create the `rate_limit_buckets` table when it is missing.
    #[serde(default = "default_true")]
    pub create_table: bool,
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

/// A bucket policy, either per minute or as an explicit capacity and refill rate.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BucketPolicy {
    /// `capacity = n`, `refill_rate = n / 60`.
    PerMinute {
        /// Requests allowed per minute.
        requests_per_minute: u32,
    },
    /// Explicit bucket dimensions.
    Explicit {
        /// Maximum number of tokens.
        capacity: i64,
        /// Tokens added per second.
        refill_rate: f64,
    },
}

impl BucketPolicy {
    /// Capacity in tokens.
    pub fn capacity(&self) -> i64 {
        match self {
            BucketPolicy::PerMinute { requests_per_minute } => i64::from(*requests_per_minute),
            BucketPolicy::Explicit { capacity, .. } => *capacity,
        }
    }

    /// Refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        match self {
            BucketPolicy::PerMinute { requests_per_minute } => f64::from(*requests_per_minute) / 60.0,
            BucketPolicy::Explicit { refill_rate, .. } => *refill_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_debug_snapshot;

    use super::*;

    #[test]
    fn default_storage_config() {
        let config = StorageConfig::default();
        assert_debug_snapshot!(config, @"Memory");
    }

    #[test]
    fn deserialize_disabled_storage() {
        let config: StorageConfig = toml::from_str(r#"type = "disabled""#).unwrap();
        assert_debug_snapshot!(config, @"Disabled");
    }

    #[test]
    fn deserialize_redis_storage_minimal() {
        let toml = indoc! {r#"
            type = "redis"
            url = "redis://localhost:6379/0"
        "#};

        let config: StorageConfig = toml::from_str(toml).unwrap();

        assert_debug_snapshot!(config, @r#"
        Redis(
            RedisConfig {
                url: "redis://localhost:6379/0",
                pool: RedisPoolConfig {
                    max_size: Some(
                        16,
                    ),
                    min_idle: Some(
                        0,
                    ),
                    timeout_create: Some(
                        5s,
                    ),
                    timeout_wait: Some(
                        5s,
                    ),
                    timeout_recycle: Some(
                        300s,
                    ),
                },
                tls: None,
                key_prefix: "rate:",
                response_timeout: Some(
                    1s,
                ),
            },
        )
        "#);
    }

    #[test]
    fn deserialize_redis_storage_with_tls() {
        let toml = indoc! {r#"
            type = "redis"
            url = "rediss://cache:6380/0"
            key_prefix = "cv:rate:"
            response_timeout = "250ms"

            [pool]
            max_size = 4

            [tls]
            enabled = true
            ca_cert_path = "/etc/ssl/ca.crt"
        "#};

        let StorageConfig::Redis(config) = toml::from_str::<StorageConfig>(toml).unwrap() else {
            unreachable!("expected redis storage");
        };

        assert_eq!(config.key_prefix, "cv:rate:");
        assert_eq!(config.response_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.pool.max_size, Some(4));
        assert_eq!(config.pool.min_idle, None);

        let tls = config.tls.unwrap();
        assert!(tls.enabled);
        assert_eq!(tls.ca_cert_path.as_deref(), Some("/etc/ssl/ca.crt"));
    }

    #[test]
    fn mirror_defaults() {
        let config: MirrorConfig = toml::from_str(r#"url = "postgres://localhost/app""#).unwrap();

        assert_debug_snapshot!(config, @r"
        MirrorConfig {
            url: SecretBox<str>([REDACTED]),
            max_connections: 5,
            acquire_timeout: 5s,
            warm_start: true,
            create_table: true,
        }
        ");
    }

    #[test]
    fn bucket_policies() {
        let config: RateLimitConfig = toml::from_str(indoc! {r#"
            [buckets."groq:default"]
            requests_per_minute = 30

            [buckets."openrouter:0a1b2c3d4e5f6a7b"]
            capacity = 50
            refill_rate = 0.5
        "#})
        .unwrap();

        assert_debug_snapshot!(config.buckets, @r#"
        {
            "groq:default": PerMinute {
                requests_per_minute: 30,
            },
            "openrouter:0a1b2c3d4e5f6a7b": Explicit {
                capacity: 50,
                refill_rate: 0.5,
            },
        }
        "#);

        let groq = config.buckets["groq:default"];
        assert_eq!(groq.capacity(), 30);
        assert_eq!(groq.refill_rate(), 0.5);
    }
}
