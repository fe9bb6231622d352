//! Exponential backoff bounded by an overall deadline.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use config::{BackoffConfig, Environment};
use tokio::time::Instant;

/// Delays between retries of one dispatch and the time budget they share.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// First delay.
    pub initial_interval: Duration,
    /// Largest delay before jitter.
    pub max_interval: Duration,
    /// Growth factor.
    pub multiplier: f64,
    /// Budget for the whole dispatch.
    pub max_elapsed_time: Duration,
}

impl From<BackoffConfig> for BackoffPolicy {
    fn from(config: BackoffConfig) -> Self {
        Self {
            initial_interval: config.initial_interval,
            max_interval: config.max_interval,
            multiplier: config.multiplier,
            max_elapsed_time: config.max_elapsed_time,
        }
    }
}

impl BackoffPolicy {
    /// The preset for `environment` without overrides.
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Test => BackoffConfig::fast().into(),
            Environment::Dev | Environment::Prod => BackoffConfig::production().into(),
        }
    }

    /// A jittered exponential sequence of delays. It ends once the delays alone
    /// would exceed the elapsed budget.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + use<> {
        let initial = self.initial_interval.max(Duration::from_millis(1));
        let max_times = (self.max_elapsed_time.as_secs_f64() / initial.as_secs_f64()).ceil() as usize;

        ExponentialBuilder::default()
            .with_min_delay(initial)
            .with_max_delay(self.max_interval.max(initial))
            .with_factor(self.multiplier.max(1.0) as f32)
            .with_max_times(max_times.max(1))
            .with_jitter()
            .build()
    }

    /// The instant the dispatch starting at `start` must finish by.
    pub fn deadline(&self, start: Instant) -> Instant {
        start + self.max_elapsed_time
    }
}

/// Time left until `deadline`, or `None` once it passed.
pub(crate) fn time_left(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    (deadline > now).then(|| deadline - now)
}
