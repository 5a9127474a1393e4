//! Error types for the sync engine.

use thiserror::Error;

use crate::store::StoreError;

/// Result type for orchestrator operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the orchestrator.
///
/// Remote-side failures (transient, permanent, conflict) are *outcomes*, not
/// errors: they are handled inside the dispatch loop and recorded on the
/// item. What reaches the caller is the local side: a store failure breaks
/// the zero-loss guarantee and must be surfaced, and a record-lifecycle
/// failure indicates an orchestration bug.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The local durable store failed.
    ///
    /// Fatal for the operation in question: the core refuses to report a
    /// business mutation as committed if its paired enqueue failed.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    /// A queue record rejected a status transition.
    #[error("record lifecycle error: {0}")]
    Record(#[from] ledgersync_queue::QueueError),

    /// The orchestrator was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Returns true if the failed operation can be retried as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Store(err) => err.is_retryable(),
            SyncError::Record(_) => false,
            SyncError::Cancelled => false,
        }
    }
}
