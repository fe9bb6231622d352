//! Refusal and low-quality detection, and the classification of one attempt.

use std::{collections::HashMap, fmt, time::Duration};

use config::QualityConfig;

use crate::{
    messages::Usage,
    provider::{FailureClass, ProviderFailure, ProviderReply},
};

/// Result of one upstream attempt. The dispatch loop has one arm per variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Well-formed content worth returning.
    Success {
        /// The completion text.
        content: String,
        /// The model that actually answered.
        model: String,
        /// Token usage, when reported.
        usage: Option<Usage>,
    },
    /// The model declined the task.
    Refusal {
        /// Phrase category or rule that matched.
        category: String,
    },
    /// The content is too thin to be a real answer.
    LowQuality(LowQuality),
    /// HTTP 429 or a quota condition.
    RateLimited {
        /// Parsed `Retry-After`, if any.
        retry_after: Option<Duration>,
    },
    /// 4xx other than 429.
    ClientError {
        /// HTTP status.
        status: u16,
        /// Upstream message, truncated.
        message: String,
    },
    /// 5xx, network, decoding or an empty 2xx.
    ServerError {
        /// HTTP status, when one was received.
        status: Option<u16>,
        /// What went wrong.
        message: String,
    },
}

/// Why a response was judged low quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowQuality {
    /// Fewer characters than the minimum.
    TooShort,
    /// Fewer words than the minimum.
    TooFewWords,
    /// One word dominates the response.
    Repetitive,
}

impl fmt::Display for LowQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => f.write_str("too short"),
            Self::TooFewWords => f.write_str("too few words"),
            Self::Repetitive => f.write_str("repetitive"),
        }
    }
}

/// Turns a provider result into an [`Outcome`].
pub fn classify(result: Result<ProviderReply, ProviderFailure>, policy: &QualityPolicy) -> Outcome {
    let reply = match result {
        Ok(reply) => reply,
        Err(failure) => {
            return match failure.class {
                FailureClass::RateLimited => Outcome::RateLimited {
                    retry_after: failure.signals.retry_after,
                },
                FailureClass::Client { status } => Outcome::ClientError {
                    status,
                    message: failure.message,
                },
                FailureClass::Server { status } => Outcome::ServerError {
                    status,
                    message: failure.message,
                },
            };
        }
    };

    let Some(content) = reply.content else {
        return Outcome::ServerError {
            status: None,
            message: "response carried no choices".to_string(),
        };
    };

    if content.trim().is_empty() {
        return Outcome::ServerError {
            status: None,
            message: "response content is empty".to_string(),
        };
    }

    if let Some(category) = policy.refusal(&content) {
        return Outcome::Refusal { category };
    }

    if let Some(reason) = policy.low_quality(&content) {
        return Outcome::LowQuality(reason);
    }

    Outcome::Success {
        content,
        model: reply.model,
        usage: reply.usage,
    }
}

/// Refusal phrases and quality thresholds, lowercased once.
#[derive(Debug, Clone)]
pub struct QualityPolicy {
    categories: Vec<(String, Vec<String>)>,
    short_refusal_chars: usize,
    short_indicators: Vec<String>,
    apology_starters: Vec<String>,
    apology_window_chars: usize,
    policy_indicators: Vec<String>,
    policy_scan_max_chars: usize,
    min_chars: usize,
    min_words: usize,
    repetition_min_words: usize,
    max_word_share: f64,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self::from(&QualityConfig::default())
    }
}

impl From<&QualityConfig> for QualityPolicy {
    fn from(config: &QualityConfig) -> Self {
        let lower = |items: &[String]| {
            items
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        };

        Self {
            categories: config
                .refusal_phrases
                .iter()
                .map(|(category, phrases)| (category.clone(), lower(phrases)))
                .collect(),
            short_refusal_chars: config.short_refusal_chars,
            short_indicators: lower(&config.short_refusal_indicators),
            apology_starters: lower(&config.apology_starters),
            apology_window_chars: config.apology_window_chars,
            policy_indicators: lower(&config.policy_indicators),
            policy_scan_max_chars: config.policy_scan_max_chars,
            min_chars: config.min_chars,
            min_words: config.min_words,
            repetition_min_words: config.repetition_min_words,
            max_word_share: config.max_word_share,
        }
    }
}

impl QualityPolicy {
    /// The refusal rule `content` trips, if any.
    pub fn refusal(&self, content: &str) -> Option<String> {
        let text = content.trim().to_lowercase();
        let length = text.chars().count();

        for (category, phrases) in &self.categories {
            if phrases.iter().any(|phrase| text.contains(phrase.as_str())) {
                return Some(category.clone());
            }
        }

        if length < self.short_refusal_chars
            && self
                .short_indicators
                .iter()
                .any(|indicator| contains_indicator(&text, indicator))
        {
            return Some("short_refusal".to_string());
        }

        if length > 10 {
            let window: String = text.chars().take(self.apology_window_chars).collect();

            if self
                .apology_starters
                .iter()
                .any(|starter| window.contains(starter.as_str()))
            {
                return Some("apology_opening".to_string());
            }
        }

        if length < self.policy_scan_max_chars
            && self
                .policy_indicators
                .iter()
                .any(|indicator| contains_indicator(&text, indicator))
        {
            return Some("policy".to_string());
        }

        None
    }

    /// The low-quality rule `content` trips, if any.
    pub fn low_quality(&self, content: &str) -> Option<LowQuality> {
        let text = content.trim();

        if text.chars().count() < self.min_chars {
            return Some(LowQuality::TooShort);
        }

        let words: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();

        if words.len() < self.min_words {
            return Some(LowQuality::TooFewWords);
        }

        if words.len() >= self.repetition_min_words {
            let mut counts: HashMap<&str, usize> = HashMap::new();

            for word in &words {
                *counts.entry(word.as_str()).or_default() += 1;
            }

            let most = counts.values().copied().max().unwrap_or_default();

            if most as f64 > words.len() as f64 * self.max_word_share {
                return Some(LowQuality::Repetitive);
            }
        }

        None
    }
}

/// Single-word indicators match whole words, phrases match as substrings.
fn contains_indicator(text: &str, indicator: &str) -> bool {
    if indicator.contains(char::is_whitespace) {
        return text.contains(indicator);
    }

    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .any(|word| word == indicator)
}
