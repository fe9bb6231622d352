//! Error types for rate limiting.

use crate::{mirror::MirrorError, storage::StorageError};

/// The limiter could not consult or update one of its stores.
///
/// Admission checks never turn this into a denial. It is reported next to an
/// allowed decision so callers can observe the outage.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// Live bucket store failure.
    #[error("Rate limiter storage unavailable: {0}")]
    Storage(#[from] StorageError),

    /// Durable mirror failure.
    #[error("Rate limiter mirror unavailable: {0}")]
    Mirror(#[from] MirrorError),
}
