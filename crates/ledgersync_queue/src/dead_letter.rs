//! Dead-letter entries.
//!
//! A dead letter is the explicit boundary where the system stops
//! auto-recovering and hands control to an operator. Entries are resolved,
//! never deleted: the attempt history and original payload stay available
//! for manual reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::{OperationType, Payload, QueueItem};

/// A terminally failed operation parked for manual reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Entry id.
    pub id: String,
    /// The operation id of the escalated record.
    pub original_operation_id: String,
    /// The acting principal of the original record.
    pub user_id: String,
    /// The tenant the original write belonged to.
    pub owner_id: String,
    /// Original mutation type.
    pub op_type: OperationType,
    /// Original target collection.
    pub collection: String,
    /// Original document id.
    pub document_id: String,
    /// Original mutation body, preserved verbatim.
    pub payload: Payload,
    /// Why the record was escalated.
    pub failure_reason: String,
    /// Total dispatch attempts before escalation.
    pub total_attempts: u32,
    /// Start of the first attempt (creation time when never attempted).
    pub first_attempt_at: DateTime<Utc>,
    /// Start of the final attempt.
    pub last_attempt_at: DateTime<Utc>,
    /// When the record left the active queue.
    pub moved_at: DateTime<Utc>,
    /// Set once an operator reconciles the entry.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator note recorded at resolution.
    pub resolution_note: Option<String>,
}

impl DeadLetterEntry {
    /// Builds an entry from an escalated queue item.
    pub fn from_item(item: &QueueItem, failure_reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            original_operation_id: item.operation_id.clone(),
            user_id: item.user_id.clone(),
            owner_id: item.owner_id.clone(),
            op_type: item.op_type.clone(),
            collection: item.collection.clone(),
            document_id: item.document_id.clone(),
            payload: item.payload.clone(),
            failure_reason: failure_reason.into(),
            total_attempts: item.retry_count,
            first_attempt_at: item.created_at,
            last_attempt_at: item.last_attempt_at.unwrap_or(item.created_at),
            moved_at: now,
            resolved_at: None,
            resolution_note: None,
        }
    }

    /// Marks the entry resolved without deleting it.
    pub fn resolve(mut self, note: impl Into<String>, now: DateTime<Utc>) -> Self {
        self.resolved_at = Some(now);
        self.resolution_note = Some(note.into());
        self
    }

    /// Returns true while the entry still requires attention.
    pub fn is_unresolved(&self) -> bool {
        self.resolved_at.is_none()
    }
}
