//! Storage backends holding the live token counts.

mod memory;
mod redis;
mod redis_pool;

pub use memory::MemoryBucketStore;
pub use redis::RedisBucketStore;

use crate::bucket::{BucketConfig, BucketState, TakeOutcome};

/// Atomic refill-and-consume storage for token buckets.
///
/// Implementations must run the whole step of [`crate::refill_and_take`] atomically
/// per key, so concurrent callers in any process observe a consistent bucket.
#[async_trait::async_trait]
pub trait BucketStore: Send + Sync {
    /// Refills the bucket at `key` up to `now`, then tries to consume `cost` tokens.
    async fn take(&self, key: &str, config: BucketConfig, now: f64, cost: f64) -> Result<TakeOutcome, StorageError>;

    /// Overwrites the state of the bucket at `key`.
    async fn restore(&self, key: &str, state: BucketState) -> Result<(), StorageError>;
}

/// Errors that can occur in storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("Query error: {0}")]
    Query(String),

    /// The store answered with something the limiter cannot interpret.
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}
