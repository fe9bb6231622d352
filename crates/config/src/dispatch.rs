//! Dispatch, retry, catalog and response quality configuration.

use std::{collections::BTreeMap, time::Duration};

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::Deserialize;

use crate::Environment;

/// Settings for the dispatch client's candidate rotation and retries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Providers in the order they are tried. Unknown or unconfigured names are skipped.
    pub provider_order: Vec<String>,
    /// Approximate number of worker processes sharing the provider accounts.
    /// Scales the per-process minimum interval between provider calls.
    pub worker_replicas: u32,
    /// Upper bound on the (provider, account, model) candidates tried for one request.
    pub max_candidates: usize,
    /// Number of alternate model ids sent upstream in the `models` array.
    pub max_fallback_models: usize,
    /// Attempts against a single candidate before rotating on server errors.
    pub max_attempts_per_candidate: u32,
    /// Timeout of a single upstream attempt, including reading the body.
    #[serde(deserialize_with = "deserialize_duration")]
    pub attempt_timeout: Duration,
    /// Sliding idle timeout while reading a streamed response.
    #[serde(deserialize_with = "deserialize_duration")]
    pub stream_idle_timeout: Duration,
    /// Request streamed responses. Defaults to `true` outside the test environment.
    pub stream: Option<bool>,
    /// Sampling temperature sent with every chat call.
    pub temperature: f32,
    /// Default completion budget when the caller does not set one.
    pub max_tokens: u32,
    /// Overrides of the environment backoff preset.
    pub backoff: BackoffOverrides,
    /// Refusal and low quality heuristics.
    pub quality: QualityConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            provider_order: vec!["groq".to_string(), "openrouter".to_string()],
            worker_replicas: 1,
            max_candidates: 8,
            max_fallback_models: 3,
            max_attempts_per_candidate: 2,
            attempt_timeout: Duration::from_secs(60),
            stream_idle_timeout: Duration::from_secs(20),
            stream: None,
            temperature: 0.2,
            max_tokens: 2048,
            backoff: BackoffOverrides::default(),
            quality: QualityConfig::default(),
        }
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// First delay.
    pub initial_interval: Duration,
    /// Largest single delay.
    pub max_interval: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Total time budget for one dispatch, sleeps included.
    pub max_elapsed_time: Duration,
}

impl BackoffConfig {
    /// Realistic timings for development and production.
    pub fn production() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(20),
            multiplier: 1.5,
            max_elapsed_time: Duration::from_secs(180),
        }
    }

    /// Short timings for automated tests.
    pub fn fast() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_elapsed_time: Duration::from_secs(5),
        }
    }
}

/// Optional overrides of the backoff preset selected by the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffOverrides {
    /// Overrides the first delay.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub initial_interval: Option<Duration>,
    /// Overrides the largest single delay.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub max_interval: Option<Duration>,
    /// Overrides the growth factor.
    pub multiplier: Option<f64>,
    /// Overrides the total time budget.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub max_elapsed_time: Option<Duration>,
}

impl BackoffOverrides {
    /// Applies the overrides on top of the preset for `environment`.
    pub fn resolve(&self, environment: Environment) -> BackoffConfig {
        let preset = match environment {
            Environment::Test => BackoffConfig::fast(),
            Environment::Dev | Environment::Prod => BackoffConfig::production(),
        };

        BackoffConfig {
            initial_interval: self.initial_interval.unwrap_or(preset.initial_interval),
            max_interval: self.max_interval.unwrap_or(preset.max_interval),
            multiplier: self.multiplier.unwrap_or(preset.multiplier),
            max_elapsed_time: self.max_elapsed_time.unwrap_or(preset.max_elapsed_time),
        }
    }
}

/// Free model catalog settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// How long a fetched model list is served before it is refreshed.
    #[serde(deserialize_with = "deserialize_duration")]
    pub refresh_interval: Duration,
    /// Timeout of the catalog HTTP request.
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Tunable refusal and low quality heuristics.
///
/// The checks are pattern and length based, so short but valid answers can be flagged.
/// Every threshold and phrase list can be replaced from configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualityConfig {
    /// Refusal phrases grouped by category, matched case-insensitively anywhere in the response.
    pub refusal_phrases: BTreeMap<String, Vec<String>>,
    /// Responses shorter than this are refusals when they contain a short indicator.
    pub short_refusal_chars: usize,
    /// Indicators for short responses. Single words match whole words only.
    pub short_refusal_indicators: Vec<String>,
    /// Openings that mark an apology.
    pub apology_starters: Vec<String>,
    /// Number of leading characters inspected for an apology opening.
    pub apology_window_chars: usize,
    /// Policy and guideline vocabulary.
    pub policy_indicators: Vec<String>,
    /// Policy indicators are only considered below this response length.
    pub policy_scan_max_chars: usize,
    /// Minimum trimmed length of an acceptable response.
    pub min_chars: usize,
    /// Minimum number of words of an acceptable response.
    pub min_words: usize,
    /// Repetition is only checked from this many words on.
    pub repetition_min_words: usize,
    /// Largest share of all words a single word may take.
    pub max_word_share: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        let phrases = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let refusal_phrases = BTreeMap::from([
            (
                "apology".to_string(),
                phrases(&[
                    "i'm sorry",
                    "i apologize",
                    "i regret",
                    "unfortunately",
                    "i'm afraid",
                    "i'm unable to help",
                    "i cannot help",
                ]),
            ),
            (
                "capability_denial".to_string(),
                phrases(&[
                    "i cannot",
                    "i can't",
                    "i am unable",
                    "i'm unable",
                    "i am not able",
                    "i'm not able",
                    "i don't have access",
                    "i don't have the ability",
                    "i lack the capability",
                ]),
            ),
            (
                "security".to_string(),
                phrases(&[
                    "access or reveal",
                    "internal system instructions",
                    "system instructions",
                    "security concerns",
                    "potentially harmful",
                    "safety guidelines",
                    "content policy",
                    "usage guidelines",
                ]),
            ),
            (
                "request_rejection".to_string(),
                phrases(&[
                    "legitimate query",
                    "can't assist with",
                    "cannot assist with",
                    "i cannot fulfill",
                    "i cannot provide",
                    "i cannot generate",
                    "i cannot create",
                    "i cannot write",
                    "i cannot analyze",
                ]),
            ),
            (
                "ethical".to_string(),
                phrases(&[
                    "ethical guidelines",
                    "responsible ai",
                    "ai safety",
                    "harmful content",
                    "inappropriate",
                    "unethical",
                    "violates guidelines",
                    "against policy",
                ]),
            ),
            (
                "technical".to_string(),
                phrases(&[
                    "technical limitations",
                    "system limitations",
                    "processing error",
                    "unable to process",
                    "request too complex",
                    "input too short",
                ]),
            ),
        ]);

        Self {
            refusal_phrases,
            short_refusal_chars: 50,
            short_refusal_indicators: phrases(&["i can't", "i cannot", "sorry", "unable", "no"]),
            apology_starters: phrases(&["i'm sorry", "i apologize", "unfortunately", "i'm afraid"]),
            apology_window_chars: 50,
            policy_indicators: phrases(&[
                "policy",
                "guidelines",
                "terms",
                "conditions",
                "rules",
                "restrictions",
                "limitations",
                "boundaries",
            ]),
            policy_scan_max_chars: 300,
            min_chars: 30,
            min_words: 5,
            repetition_min_words: 10,
            max_word_share: 1.0 / 3.0,
        }
    }
}
