//! Minimum spacing between calls made with the same account from this process.

use std::{num::NonZeroU32, time::Duration};

use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
};

type KeyedRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Spaces calls per account by `min_interval × worker_replicas`, so that a
/// fleet of workers together stays near the provider's own pace.
pub(crate) struct Pacer {
    limiter: Option<KeyedRateLimiter>,
    period: Duration,
}

impl Pacer {
    /// A zero interval disables pacing.
    pub(crate) fn new(min_interval: Duration, worker_replicas: u32) -> Self {
        let period = min_interval.saturating_mul(worker_replicas.max(1));

        let limiter = Quota::with_period(period)
            .map(|quota| quota.allow_burst(NonZeroU32::MIN))
            .map(RateLimiter::keyed);

        Self { limiter, period }
    }

    /// Waits until `account` may call again.
    pub(crate) async fn wait(&self, account: &str) {
        let Some(limiter) = &self.limiter else {
            return;
        };

        let key = account.to_string();

        while let Err(not_until) = limiter.check_key(&key) {
            let wait = not_until.wait_time_from(DefaultClock::default().now());

            log::debug!("Pacing {account} for {wait:?} (period {:?})", self.period);

            tokio::time::sleep(wait).await;
        }
    }
}
