//! Configuration structures mapping the dispatcher TOML file.

#![deny(missing_docs)]

mod dispatch;
mod loader;
mod providers;
mod rate_limit;

use std::path::Path;

pub use dispatch::{BackoffConfig, BackoffOverrides, CatalogConfig, DispatchConfig, QualityConfig};
pub use providers::{GroqConfig, OpenAiConfig, OpenRouterConfig, ProvidersConfig, usable_keys};
pub use rate_limit::*;
use serde::Deserialize;

/// Main configuration structure for the dispatch layer.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Deployment environment, selecting backoff presets and streaming defaults.
    #[serde(default)]
    pub environment: Environment,
    /// Distributed rate limiter settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Upstream provider accounts.
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Free model catalog settings.
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Dispatch, retry and response quality settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates that at least one provider account is usable and the backoff settings are coherent.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }

    /// The backoff settings in effect: the environment preset with any overrides applied.
    pub fn backoff(&self) -> BackoffConfig {
        self.dispatch.backoff.resolve(self.environment)
    }

    /// Whether chat calls request server-sent-event responses.
    pub fn streaming_enabled(&self) -> bool {
        self.dispatch.stream.unwrap_or(self.environment != Environment::Test)
    }
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development.
    #[default]
    Dev,
    /// Automated tests, using fast backoff timings.
    Test,
    /// Production.
    Prod,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_debug_snapshot!(&config.environment, @"Dev");
        assert!(config.streaming_enabled());
        assert!(config.providers.groq.is_none());
        assert!(config.providers.openrouter.is_none());
        assert!(config.rate_limit.mirror.is_none());
    }

    #[test]
    fn test_environment_disables_streaming_and_uses_fast_backoff() {
        let config: Config = toml::from_str(r#"environment = "test""#).unwrap();

        assert!(!config.streaming_enabled());
        assert_debug_snapshot!(config.backoff(), @r"
        BackoffConfig {
            initial_interval: 100ms,
            max_interval: 1s,
            multiplier: 2.0,
            max_elapsed_time: 5s,
        }
        ");
    }

    #[test]
    fn explicit_stream_flag_wins_over_environment() {
        let config: Config = toml::from_str(indoc! {r#"
            environment = "test"

            [dispatch]
            stream = true
        "#})
        .unwrap();

        assert!(config.streaming_enabled());
    }

    #[test]
    fn backoff_overrides_apply_on_top_of_preset() {
        let config: Config = toml::from_str(indoc! {r#"
            environment = "prod"

            [dispatch.backoff]
            initial_interval = "500ms"
            max_elapsed_time = "30s"
        "#})
        .unwrap();

        assert_debug_snapshot!(config.backoff(), @r"
        BackoffConfig {
            initial_interval: 500ms,
            max_interval: 20s,
            multiplier: 1.5,
            max_elapsed_time: 30s,
        }
        ");
    }

    #[test]
    fn unknown_top_level_field_is_rejected() {
        let result = toml::from_str::<Config>("listen_address = \"127.0.0.1:8000\"");
        assert!(result.is_err());
    }
}
