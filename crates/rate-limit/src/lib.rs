//! Distributed token bucket rate limiting.
//!
//! Bucket state is shared by every worker process through a [`BucketStore`]:
//! - Redis, where one Lua script refills and consumes atomically
//! - process memory, for single-process deployments and tests
//!
//! A [`DurableMirror`] keeps a Postgres copy of every bucket, so a freshly
//! deployed fleet resumes from the last known token counts instead of full buckets.
//!
//! The limiter fails open: a missing store, a missing policy or a store error
//! never denies a request.

#![deny(missing_docs)]

mod bucket;
mod clock;
mod error;
mod limiter;
mod metrics;
mod mirror;
mod storage;

pub use bucket::{BucketConfig, BucketSnapshot, BucketState, TakeOutcome, bucket_key, refill_and_take};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::LimiterError;
pub use limiter::{Admission, TokenBucketLimiter};
pub use mirror::{DurableMirror, MirrorError, PostgresMirror};
pub use storage::{BucketStore, MemoryBucketStore, RedisBucketStore, StorageError};
