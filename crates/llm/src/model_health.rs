//! Per-model failure tracking and candidate ordering.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

const BASE_BLOCK: Duration = Duration::from_secs(20);
const MAX_BLOCK: Duration = Duration::from_secs(2 * 60 * 60);
const FAILURES_BEFORE_BLOCK: u32 = 5;
const MAX_DOUBLINGS: u32 = 10;

#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    failures: u32,
    blocked_until: Option<Instant>,
}

/// Health of the models this process has called.
#[derive(Debug, Default)]
pub struct ModelHealth {
    entries: DashMap<String, Entry>,
}

impl ModelHealth {
    /// No model has failed yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a failed attempt. From the fifth consecutive failure on the model
    /// is blocked, for longer with every further failure.
    pub fn record_failure(&self, model: &str) {
        let mut entry = self.entries.entry(model.to_string()).or_default();
        entry.failures += 1;

        if entry.failures >= FAILURES_BEFORE_BLOCK {
            let doublings = (entry.failures - 1).min(MAX_DOUBLINGS);
            let block = (BASE_BLOCK * 2u32.pow(doublings)).min(MAX_BLOCK);

            entry.blocked_until = Some(Instant::now() + block);

            log::warn!(
                "Model {model} blocked for {block:?} after {} consecutive failures",
                entry.failures
            );
        }
    }

    /// Blocks `model` for `retry_after`, or the base block when none was given.
    pub fn record_rate_limit(&self, model: &str, retry_after: Option<Duration>) {
        let block = retry_after.filter(|d| !d.is_zero()).unwrap_or(BASE_BLOCK);

        let mut entry = self.entries.entry(model.to_string()).or_default();
        entry.failures += 1;
        entry.blocked_until = Some(Instant::now() + block);

        log::info!("Model {model} rate limited, blocked for {block:?}");
    }

    /// Clears the failure count and any block.
    pub fn record_success(&self, model: &str) {
        if let Some((_, entry)) = self.entries.remove(model)
            && entry.failures > 0
        {
            log::info!("Model {model} recovered after {} failures", entry.failures);
        }
    }

    /// Time left on the block of `model`.
    pub fn remaining(&self, model: &str) -> Option<Duration> {
        let until = self.entries.get(model)?.blocked_until?;
        let now = Instant::now();

        (until > now).then(|| until - now)
    }

    /// Orders `models` for one dispatch: unblocked models first, rotated by
    /// `offset` so concurrent calls spread over them, then blocked models by
    /// shortest remaining wait.
    pub fn order(&self, models: &[String], offset: usize) -> Vec<String> {
        let mut available = Vec::new();
        let mut blocked = Vec::new();

        for model in models {
            match self.remaining(model) {
                Some(wait) => blocked.push((wait, model.clone())),
                None => available.push(model.clone()),
            }
        }

        if !available.is_empty() {
            let shift = offset % available.len();
            available.rotate_left(shift);
        }

        blocked.sort_by_key(|(wait, _)| *wait);
        available.extend(blocked.into_iter().map(|(_, model)| model));

        available
    }

    /// Whether every model in `models` is blocked.
    pub fn all_blocked(&self, models: &[String]) -> bool {
        !models.is_empty() && models.iter().all(|model| self.remaining(model).is_some())
    }
}
