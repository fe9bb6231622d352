//! Token bucket admission control shared by every worker process.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;

use config::{RateLimitConfig, StorageConfig};

use crate::{
    bucket::{BucketConfig, BucketSnapshot, BucketState},
    clock::{Clock, SystemClock},
    error::LimiterError,
    metrics::{AdmissionMetrics, Decision},
    mirror::{DurableMirror, PostgresMirror},
    storage::{BucketStore, MemoryBucketStore, RedisBucketStore, StorageError},
};

/// Decision of one admission check.
#[derive(Debug)]
pub struct Admission {
    /// Whether the caller may proceed.
    pub allowed: bool,
    /// How long until the requested cost is available. Zero when allowed.
    pub retry_after: Duration,
    /// Tokens left in the bucket, when a store was consulted.
    pub tokens: Option<f64>,
    /// Store failure behind an allowed decision.
    pub error: Option<LimiterError>,
}

impl Admission {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            tokens: None,
            error: None,
        }
    }
}

/// Distributed token bucket limiter.
///
/// Bucket policies live in process memory and may differ between processes.
/// Token counts live in the [`BucketStore`], which is the only authority on them.
/// Every failure mode allows the request.
pub struct TokenBucketLimiter {
    store: Option<Arc<dyn BucketStore>>,
    mirror: Option<Arc<dyn DurableMirror>>,
    buckets: RwLock<HashMap<String, BucketConfig>>,
    clock: Arc<dyn Clock>,
    mirror_writes: TaskTracker,
    metrics: AdmissionMetrics,
}

impl TokenBucketLimiter {
    /// Creates a limiter over `store` with no bucket policies.
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self {
            store: Some(store),
            mirror: None,
            buckets: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            mirror_writes: TaskTracker::new(),
            metrics: AdmissionMetrics::new(),
        }
    }

    /// A limiter without a store. Every check is allowed.
    pub fn disabled() -> Self {
        Self {
            store: None,
            mirror: None,
            buckets: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            mirror_writes: TaskTracker::new(),
            metrics: AdmissionMetrics::new(),
        }
    }

    /// Mirrors every bucket update into `mirror`.
    pub fn with_mirror(mut self, mirror: Arc<dyn DurableMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Replaces the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Installs initial bucket policies.
    pub fn with_buckets(self, buckets: impl IntoIterator<Item = (String, BucketConfig)>) -> Self {
        Self {
            buckets: RwLock::new(buckets.into_iter().collect()),
            ..self
        }
    }

    /// Builds the store, the mirror and the seed policies from configuration, then
    /// warm-starts the store when the mirror asks for it.
    ///
    /// A failing live store is an error. A failing mirror is logged and the limiter runs without it.
    pub async fn from_config(config: &RateLimitConfig) -> Result<Self, LimiterError> {
        let mut limiter = match &config.storage {
            StorageConfig::Memory => Self::new(Arc::new(MemoryBucketStore::new())),
            StorageConfig::Redis(redis) => Self::new(Arc::new(RedisBucketStore::connect(redis).await?)),
            StorageConfig::Disabled => Self::disabled(),
        };

        let buckets = config
            .buckets
            .iter()
            .map(|(key, policy)| (key.clone(), BucketConfig::from(*policy)));

        limiter = limiter.with_buckets(buckets);

        let Some(mirror_config) = &config.mirror else {
            return Ok(limiter);
        };

        match PostgresMirror::connect(mirror_config).await {
            Ok(mirror) => limiter = limiter.with_mirror(Arc::new(mirror)),
            Err(e) => {
                log::error!("Rate limit mirror unavailable, running without it: {e}");
                return Ok(limiter);
            }
        }

        if mirror_config.warm_start
            && let Err(e) = limiter.warm_start().await
        {
            log::error!("Failed to warm-start rate limit buckets: {e}");
        }

        Ok(limiter)
    }

    /// Whether a store is attached.
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Sets or replaces the policy of one bucket.
    pub async fn set_bucket_config(&self, key: impl Into<String>, config: BucketConfig) {
        let key = key.into();
        log::debug!(
            "Bucket '{key}' set to capacity {} refilling {}/s",
            config.capacity,
            config.refill_rate
        );

        self.buckets.write().await.insert(key, config);
    }

    /// The policy of one bucket, if any.
    pub async fn bucket_config(&self, key: &str) -> Option<BucketConfig> {
        self.buckets.read().await.get(key).copied()
    }

    /// Tries to consume `cost` tokens from the bucket at `key`. A non-positive cost counts as one.
    ///
    /// Allowed without touching the store when no store is attached or the bucket has no policy.
    pub async fn allow(&self, key: &str, cost: i64) -> Admission {
        let Some(store) = &self.store else {
            self.metrics.count(key, Decision::Unlimited);
            return Admission::unlimited();
        };

        let Some(config) = self.bucket_config(key).await.filter(BucketConfig::is_configured) else {
            self.metrics.count(key, Decision::Unlimited);
            return Admission::unlimited();
        };

        let cost = if cost <= 0 { 1 } else { cost };
        let now = self.clock.now();

        let start = std::time::Instant::now();
        let taken = store.take(key, config, now, cost as f64).await;
        self.metrics.record_store(key, start);

        let outcome = match taken {
            Ok(outcome) => outcome,
            Err(StorageError::UnexpectedReply(reply)) => {
                log::error!("Rate limiter returned an unexpected reply for bucket '{key}': {reply}");
                self.metrics.count(key, Decision::StoreError);

                return Admission::unlimited();
            }
            Err(e) => {
                log::error!("Rate limiter store error for bucket '{key}': {e}");
                self.metrics.count(key, Decision::StoreError);

                return Admission {
                    error: Some(LimiterError::Storage(e)),
                    ..Admission::unlimited()
                };
            }
        };

        let decision = if outcome.allowed { Decision::Allowed } else { Decision::Denied };
        self.metrics.count(key, decision);

        self.mirror_bucket(key, config, outcome.state);

        Admission {
            allowed: outcome.allowed,
            retry_after: Duration::try_from_secs_f64(outcome.retry_after_secs).unwrap_or_default(),
            tokens: Some(outcome.state.tokens),
            error: None,
        }
    }

    /// Copies the mirrored bucket states into the live store.
    ///
    /// Returns the number of restored buckets. A no-op without a store or a mirror.
    pub async fn warm_start(&self) -> Result<usize, LimiterError> {
        let (Some(store), Some(mirror)) = (&self.store, &self.mirror) else {
            return Ok(0);
        };

        let snapshots = mirror.load_all().await?;
        let mut restored = 0;

        for snapshot in snapshots {
            match store.restore(&snapshot.key, snapshot.state).await {
                Ok(()) => restored += 1,
                Err(e) => log::error!("Failed to warm bucket '{}' from the mirror: {e}", snapshot.key),
            }
        }

        log::info!("Warm-started {restored} rate limit buckets");

        Ok(restored)
    }

    /// Waits up to `timeout` for pending mirror writes.
    ///
    /// Returns whether every write finished. Short-lived processes call this before exiting.
    pub async fn flush_mirror(&self, timeout: Duration) -> bool {
        self.mirror_writes.close();
        let flushed = tokio::time::timeout(timeout, self.mirror_writes.wait()).await.is_ok();
        self.mirror_writes.reopen();

        if !flushed {
            log::warn!(
                "{} rate limit mirror writes still pending after {timeout:?}",
                self.mirror_writes.len()
            );
        }

        flushed
    }

    fn mirror_bucket(&self, key: &str, config: BucketConfig, state: BucketState) {
        let Some(mirror) = self.mirror.clone() else {
            return;
        };

        let snapshot = BucketSnapshot {
            key: key.to_string(),
            config,
            state,
        };

        self.mirror_writes.spawn(async move {
            if let Err(e) = mirror.upsert(&snapshot).await {
                log::error!("Failed to mirror rate limit bucket '{}': {e}", snapshot.key);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{ManualClock, bucket::TakeOutcome, mirror::MirrorError};

    #[derive(Default)]
    struct FakeMirror {
        rows: Mutex<HashMap<String, BucketSnapshot>>,
    }

    #[async_trait::async_trait]
    impl DurableMirror for FakeMirror {
        async fn upsert(&self, snapshot: &BucketSnapshot) -> Result<(), MirrorError> {
            self.rows.lock().unwrap().insert(snapshot.key.clone(), snapshot.clone());
            Ok(())
        }

        async fn load_all(&self) -> Result<Vec<BucketSnapshot>, MirrorError> {
            Ok(self.rows.lock().unwrap().values().cloned().collect())
        }
    }

    struct BrokenStore {
        unexpected: bool,
    }

    #[async_trait::async_trait]
    impl BucketStore for BrokenStore {
        async fn take(&self, _: &str, _: BucketConfig, _: f64, _: f64) -> Result<TakeOutcome, StorageError> {
            if self.unexpected {
                Err(StorageError::UnexpectedReply("[1]".to_string()))
            } else {
                Err(StorageError::Connection("connection refused".to_string()))
            }
        }

        async fn restore(&self, _: &str, _: BucketState) -> Result<(), StorageError> {
            Err(StorageError::Connection("connection refused".to_string()))
        }
    }

    fn memory_limiter(clock: Arc<ManualClock>) -> TokenBucketLimiter {
        TokenBucketLimiter::new(Arc::new(MemoryBucketStore::new())).with_clock(clock)
    }

    /// Lets spawned mirror writes run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn disabled_limiter_allows_everything() {
        let limiter = TokenBucketLimiter::disabled();
        limiter.set_bucket_config("k", BucketConfig::new(1, 1.0)).await;

        for _ in 0..5 {
            let admission = limiter.allow("k", 1).await;
            assert!(admission.allowed);
            assert_eq!(admission.retry_after, Duration::ZERO);
            assert!(admission.error.is_none());
        }
    }

    #[tokio::test]
    async fn unconfigured_bucket_allows_any_cost() {
        let limiter = memory_limiter(Arc::new(ManualClock::new(0.0)));
        limiter.set_bucket_config("zero", BucketConfig::new(0, 1.0)).await;

        for cost in [1, 100, -3] {
            let admission = limiter.allow("unknown", cost).await;
            assert!(admission.allowed);
            assert_eq!(admission.retry_after, Duration::ZERO);
            assert!(admission.tokens.is_none());

            assert!(limiter.allow("zero", cost).await.allowed);
        }
    }

    #[tokio::test]
    async fn capacity_is_enforced_and_recovers_after_retry_after() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let limiter = memory_limiter(clock.clone());
        limiter.set_bucket_config("k", BucketConfig::new(3, 0.5)).await;

        for expected in [2.0, 1.0, 0.0] {
            let admission = limiter.allow("k", 1).await;
            assert!(admission.allowed);
            assert_eq!(admission.tokens, Some(expected));
        }

        let denied = limiter.allow("k", 1).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(2));

        clock.advance(denied.retry_after);

        assert!(limiter.allow("k", 1).await.allowed);
    }

    #[tokio::test]
    async fn non_positive_cost_counts_as_one() {
        let limiter = memory_limiter(Arc::new(ManualClock::new(0.0)));
        limiter.set_bucket_config("k", BucketConfig::new(2, 0.001)).await;

        assert_eq!(limiter.allow("k", 0).await.tokens, Some(1.0));
        assert_eq!(limiter.allow("k", -7).await.tokens, Some(0.0));
        assert!(!limiter.allow("k", 0).await.allowed);
    }

    #[tokio::test]
    async fn store_errors_fail_open_with_the_error() {
        let limiter = TokenBucketLimiter::new(Arc::new(BrokenStore { unexpected: false }));
        limiter.set_bucket_config("k", BucketConfig::new(1, 1.0)).await;

        let admission = limiter.allow("k", 1).await;

        assert!(admission.allowed);
        assert_eq!(admission.retry_after, Duration::ZERO);
        assert!(matches!(
            admission.error,
            Some(LimiterError::Storage(StorageError::Connection(_)))
        ));
    }

    #[tokio::test]
    async fn unexpected_reply_fails_open_without_error() {
        let limiter = TokenBucketLimiter::new(Arc::new(BrokenStore { unexpected: true }));
        limiter.set_bucket_config("k", BucketConfig::new(1, 1.0)).await;

        let admission = limiter.allow("k", 1).await;

        assert!(admission.allowed);
        assert!(admission.error.is_none());
    }

    #[tokio::test]
    async fn every_decision_is_mirrored() {
        let mirror = Arc::new(FakeMirror::default());
        let limiter = memory_limiter(Arc::new(ManualClock::new(50.0))).with_mirror(mirror.clone());
        limiter.set_bucket_config("groq:default", BucketConfig::new(1, 0.1)).await;

        limiter.allow("groq:default", 1).await;
        limiter.allow("groq:default", 1).await;
        settle().await;

        let rows = mirror.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].config, BucketConfig::new(1, 0.1));
        assert_eq!(rows[0].state.tokens, 0.0);
        assert_eq!(rows[0].state.last_refill, 50.0);
    }

    struct SlowMirror {
        inner: FakeMirror,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl DurableMirror for SlowMirror {
        async fn upsert(&self, snapshot: &BucketSnapshot) -> Result<(), MirrorError> {
            tokio::time::sleep(self.delay).await;
            self.inner.upsert(snapshot).await
        }

        async fn load_all(&self) -> Result<Vec<BucketSnapshot>, MirrorError> {
            self.inner.load_all().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_for_pending_mirror_writes() {
        let mirror = Arc::new(SlowMirror {
            inner: FakeMirror::default(),
            delay: Duration::from_millis(300),
        });

        let limiter = memory_limiter(Arc::new(ManualClock::new(0.0))).with_mirror(mirror.clone());
        limiter.set_bucket_config("k", BucketConfig::new(2, 1.0)).await;

        limiter.allow("k", 1).await;
        assert!(mirror.load_all().await.unwrap().is_empty());

        assert!(limiter.flush_mirror(Duration::from_secs(1)).await);
        assert_eq!(mirror.load_all().await.unwrap().len(), 1);

        // still accepts writes after a flush
        limiter.allow("other", 1).await;
        limiter.allow("k", 1).await;
        assert!(limiter.flush_mirror(Duration::from_secs(1)).await);
        assert_eq!(mirror.load_all().await.unwrap()[0].state.tokens, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_gives_up_after_the_timeout() {
        let mirror = Arc::new(SlowMirror {
            inner: FakeMirror::default(),
            delay: Duration::from_secs(30),
        });

        let limiter = memory_limiter(Arc::new(ManualClock::new(0.0))).with_mirror(mirror.clone());
        limiter.set_bucket_config("k", BucketConfig::new(2, 1.0)).await;

        limiter.allow("k", 1).await;

        assert!(!limiter.flush_mirror(Duration::from_millis(100)).await);
        assert!(mirror.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn warm_start_reproduces_decisions() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mirror = Arc::new(FakeMirror::default());
        let config = BucketConfig::new(3, 0.25);

        let original = memory_limiter(clock.clone()).with_mirror(mirror.clone());
        original.set_bucket_config("k", config).await;

        original.allow("k", 1).await;
        original.allow("k", 1).await;
        settle().await;

        let restarted = memory_limiter(clock.clone()).with_mirror(mirror.clone());
        restarted.set_bucket_config("k", config).await;
        assert_eq!(restarted.warm_start().await.unwrap(), 1);

        let timeline = [0.0, 0.0, 1.0, 4.0, 0.0, 0.0];

        for step in timeline {
            clock.advance(Duration::from_secs_f64(step));

            let a = original.allow("k", 1).await;
            let b = restarted.allow("k", 1).await;

            assert_eq!(a.allowed, b.allowed);
            assert_eq!(a.retry_after, b.retry_after);
        }
    }

    #[tokio::test]
    async fn warm_start_without_mirror_is_a_no_op() {
        let limiter = memory_limiter(Arc::new(ManualClock::new(0.0)));
        assert_eq!(limiter.warm_start().await.unwrap(), 0);

        let disabled = TokenBucketLimiter::disabled().with_mirror(Arc::new(FakeMirror::default()));
        assert_eq!(disabled.warm_start().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_config_updates_and_checks() {
        let limiter = Arc::new(memory_limiter(Arc::new(ManualClock::new(0.0))));
        let mut handles = Vec::new();

        for i in 0..20 {
            let limiter = limiter.clone();

            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    limiter.set_bucket_config("shared", BucketConfig::new(100, 1.0)).await;
                } else {
                    limiter.allow("shared", 1).await;
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            limiter.bucket_config("shared").await,
            Some(BucketConfig::new(100, 1.0))
        );
    }
}
