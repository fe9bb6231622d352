//! In-process bucket storage.

use dashmap::{DashMap, mapref::entry::Entry};

use super::{BucketStore, StorageError};
use crate::bucket::{BucketConfig, BucketState, TakeOutcome, refill_and_take};

/// Bucket storage local to one process.
///
/// Each key is updated under its map entry lock, which gives the same per-key
/// atomicity as the Redis script within a single process.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: DashMap<String, BucketState>,
}

impl MemoryBucketStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a bucket, if it was ever touched.
    pub fn state(&self, key: &str) -> Option<BucketState> {
        self.buckets.get(key).map(|entry| *entry)
    }
}

#[async_trait::async_trait]
impl BucketStore for MemoryBucketStore {
    async fn take(&self, key: &str, config: BucketConfig, now: f64, cost: f64) -> Result<TakeOutcome, StorageError> {
        let outcome = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let outcome = refill_and_take(Some(*entry.get()), config, now, cost);
                entry.insert(outcome.state);
                outcome
            }
            Entry::Vacant(entry) => {
                let outcome = refill_and_take(None, config, now, cost);
                entry.insert(outcome.state);
                outcome
            }
        };

        Ok(outcome)
    }

    async fn restore(&self, key: &str, state: BucketState) -> Result<(), StorageError> {
        self.buckets.insert(key.to_string(), state);
        Ok(())
    }
}
