//! Error types for queue records.

use thiserror::Error;

/// Result type for queue record operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by queue record lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A status transition that the state machine does not allow.
    ///
    /// An illegal edge indicates an orchestration bug, never a legitimate
    /// business outcome, so it is surfaced instead of applied.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Attempted target status.
        to: String,
    },

    /// A multi-step operation with no steps.
    #[error("multi-step operation {parent_id} has no steps")]
    EmptyOperationGroup {
        /// The parent operation id.
        parent_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = QueueError::InvalidTransition {
            from: "SYNCED".into(),
            to: "PENDING".into(),
        };
        assert!(err.to_string().contains("SYNCED"));
        assert!(err.to_string().contains("PENDING"));
    }
}
