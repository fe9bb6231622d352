//! Durable copies of the bucket states, used to warm-start the live store.

mod postgres;

pub use postgres::PostgresMirror;

use crate::bucket::BucketSnapshot;

/// A durable store of bucket snapshots keyed by bucket key.
#[async_trait::async_trait]
pub trait DurableMirror: Send + Sync {
    /// Inserts or replaces the snapshot of one bucket.
    async fn upsert(&self, snapshot: &BucketSnapshot) -> Result<(), MirrorError>;

    /// Reads every stored snapshot.
    async fn load_all(&self) -> Result<Vec<BucketSnapshot>, MirrorError>;
}

/// Errors of the durable mirror.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// The database could not be reached.
    #[error("Mirror connection error: {0}")]
    Connection(String),

    /// A statement failed.
    #[error("Mirror query error: {0}")]
    Query(String),
}
