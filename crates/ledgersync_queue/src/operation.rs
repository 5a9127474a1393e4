//! Operation records and the status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::hash::{canonical_payload_hash, operation_id_for};

/// The mutation body: a string-keyed map of structured values.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Type of queued mutation.
///
/// Serializes to a stable string code. An unrecognized code parses to
/// [`OperationType::Unknown`] carrying the original text; unknown input is
/// preserved and observable at the call site, never silently reinterpreted
/// as a create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum OperationType {
    /// A new document is created.
    Create,
    /// An existing document is updated.
    Update,
    /// A document is deleted.
    Delete,
    /// A file/blob is uploaded alongside its metadata document.
    UploadFile,
    /// An unrecognized persisted code, kept verbatim.
    Unknown(String),
}

impl OperationType {
    /// Returns the stable string code.
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
            OperationType::UploadFile => "UPLOAD_FILE",
            OperationType::Unknown(original) => original,
        }
    }

    /// Parses a string code.
    ///
    /// Never fails: anything unrecognized becomes [`OperationType::Unknown`]
    /// with the original text, so a corrupted or future code survives a
    /// round-trip and can be flagged where it is consumed.
    pub fn parse(code: &str) -> Self {
        match code {
            "CREATE" => OperationType::Create,
            "UPDATE" => OperationType::Update,
            "DELETE" => OperationType::Delete,
            "UPLOAD_FILE" => OperationType::UploadFile,
            other => OperationType::Unknown(other.to_string()),
        }
    }

    /// Returns true for a code that did not match any known variant.
    pub fn is_unknown(&self) -> bool {
        matches!(self, OperationType::Unknown(_))
    }
}

impl From<String> for OperationType {
    fn from(code: String) -> Self {
        OperationType::parse(&code)
    }
}

impl From<OperationType> for String {
    fn from(op: OperationType) -> Self {
        op.as_str().to_string()
    }
}

/// States of an operation record's active life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Durably enqueued, not yet dispatched.
    Pending,
    /// A dispatch attempt is in flight.
    InProgress,
    /// The remote store accepted the operation. Terminal.
    Synced,
    /// A permanent failure was recorded; awaiting dead-letter escalation.
    Failed,
    /// A transient failure was recorded; eligible again after backoff.
    Retry,
    /// Escalated out of the active queue. Terminal.
    DeadLetter,
}

impl SyncStatus {
    /// Returns the stable string code.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::InProgress => "IN_PROGRESS",
            SyncStatus::Synced => "SYNCED",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Retry => "RETRY",
            SyncStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    /// Parses a string code.
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "PENDING" => Some(SyncStatus::Pending),
            "IN_PROGRESS" => Some(SyncStatus::InProgress),
            "SYNCED" => Some(SyncStatus::Synced),
            "FAILED" => Some(SyncStatus::Failed),
            "RETRY" => Some(SyncStatus::Retry),
            "DEAD_LETTER" => Some(SyncStatus::DeadLetter),
            _ => None,
        }
    }

    /// Returns true once the record's active life is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Synced | SyncStatus::DeadLetter)
    }

    /// Returns true if the state machine allows the given edge.
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        matches!(
            (self, next),
            (SyncStatus::Pending, SyncStatus::InProgress)
                | (SyncStatus::InProgress, SyncStatus::Synced)
                | (SyncStatus::InProgress, SyncStatus::Retry)
                | (SyncStatus::InProgress, SyncStatus::Failed)
                | (SyncStatus::InProgress, SyncStatus::DeadLetter)
                | (SyncStatus::Retry, SyncStatus::InProgress)
                | (SyncStatus::Retry, SyncStatus::DeadLetter)
                | (SyncStatus::Failed, SyncStatus::DeadLetter)
        )
    }
}

/// One queued mutation destined for the remote store.
///
/// `QueueItem` is the unit of work and of the state machine. It is
/// immutable-with-copy: lifecycle transitions consume the record and return
/// a new one, and every transition is validated against
/// [`SyncStatus::can_transition_to`].
///
/// # Tenant isolation
///
/// `owner_id` is attached at creation from the caller's verified tenant
/// context and is never inferred from the payload. The remote client
/// contract namespaces every write by it, which makes cross-tenant writes
/// structurally unreachable even when `user_id` is attacker-influenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Deterministic, idempotent identifier for this logical mutation.
    pub operation_id: String,
    /// Type of mutation.
    pub op_type: OperationType,
    /// Logical entity/table name the mutation targets.
    pub collection: String,
    /// Entity id within the collection.
    pub document_id: String,
    /// The mutation body.
    pub payload: Payload,
    /// Canonical hash of `payload`, independent of field order.
    pub payload_hash: String,
    /// The acting principal.
    pub user_id: String,
    /// The tenant/business the write belongs to.
    pub owner_id: String,
    /// Current state-machine status.
    pub status: SyncStatus,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// Dispatch priority; lower values are served first.
    pub priority: i32,
    /// Creation time; also an input to `operation_id`.
    pub created_at: DateTime<Utc>,
    /// Start of the most recent dispatch attempt, if any.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Error text from the most recent failed attempt.
    pub last_error: Option<String>,
    /// 1-based position within a multi-step group.
    pub step_number: u32,
    /// Total steps in the group this record belongs to.
    pub total_steps: u32,
    /// Shared id of the multi-step group, if any.
    pub parent_operation_id: Option<String>,
    /// Dependency group key; equals `parent_operation_id` for grouped records.
    pub dependency_group: Option<String>,
    /// Set only on transition into `Synced`.
    pub synced_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Creates a new pending record for a standalone mutation.
    ///
    /// Performs no I/O and cannot fail for well-formed inputs. The
    /// `operation_id` is derived from `(op_type, collection, document_id,
    /// created_at)` so that a replayed enqueue collapses to the same logical
    /// delivery.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        user_id: impl Into<String>,
        owner_id: impl Into<String>,
        op_type: OperationType,
        collection: impl Into<String>,
        document_id: impl Into<String>,
        payload: Payload,
        created_at: DateTime<Utc>,
    ) -> Self {
        let collection = collection.into();
        let document_id = document_id.into();
        let operation_id = operation_id_for(&op_type, &collection, &document_id, created_at);
        let payload_hash = canonical_payload_hash(&payload);

        Self {
            operation_id,
            op_type,
            collection,
            document_id,
            payload,
            payload_hash,
            user_id: user_id.into(),
            owner_id: owner_id.into(),
            status: SyncStatus::Pending,
            retry_count: 0,
            priority: 100,
            created_at,
            last_attempt_at: None,
            last_error: None,
            step_number: 1,
            total_steps: 1,
            parent_operation_id: None,
            dependency_group: None,
            synced_at: None,
        }
    }

    /// Sets the dispatch priority (lower is served first).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Stamps this record as one step of a multi-step group.
    pub fn with_group(
        mut self,
        parent_operation_id: impl Into<String>,
        step_number: u32,
        total_steps: u32,
    ) -> Self {
        let parent = parent_operation_id.into();
        // Step position participates in the id so sibling steps that target
        // the same document still get distinct idempotent ids.
        self.operation_id = format!("{}:{}", self.operation_id, step_number);
        self.dependency_group = Some(parent.clone());
        self.parent_operation_id = Some(parent);
        self.step_number = step_number;
        self.total_steps = total_steps;
        self
    }

    /// Begins a dispatch attempt: `Pending`/`Retry` → `InProgress`.
    pub fn begin_attempt(self, now: DateTime<Utc>) -> QueueResult<Self> {
        let mut next = self.transition(SyncStatus::InProgress)?;
        next.last_attempt_at = Some(now);
        Ok(next)
    }

    /// Records remote acceptance: `InProgress` → `Synced`.
    pub fn complete(self, now: DateTime<Utc>) -> QueueResult<Self> {
        let mut next = self.transition(SyncStatus::Synced)?;
        next.synced_at = Some(now);
        Ok(next)
    }

    /// Records a transient failure: `InProgress` → `Retry`.
    ///
    /// Increments the retry count and re-anchors `last_attempt_at` so the
    /// backoff window opens from the failure, not from the original dispatch.
    pub fn record_failure(self, error: impl Into<String>, now: DateTime<Utc>) -> QueueResult<Self> {
        let mut next = self.transition(SyncStatus::Retry)?;
        next.retry_count += 1;
        next.last_error = Some(error.into());
        next.last_attempt_at = Some(now);
        Ok(next)
    }

    /// Records a permanent failure: `InProgress` → `Failed`.
    pub fn abandon(self, error: impl Into<String>, now: DateTime<Utc>) -> QueueResult<Self> {
        let mut next = self.transition(SyncStatus::Failed)?;
        next.retry_count += 1;
        next.last_error = Some(error.into());
        next.last_attempt_at = Some(now);
        Ok(next)
    }

    /// Escalates out of the active queue: `Retry`/`Failed`/`InProgress` →
    /// `DeadLetter`.
    pub fn escalate(self) -> QueueResult<Self> {
        self.transition(SyncStatus::DeadLetter)
    }

    /// Returns true if this record belongs to a multi-step group.
    pub fn is_grouped(&self) -> bool {
        self.dependency_group.is_some()
    }

    /// Applies a validated status transition, returning the updated copy.
    fn transition(mut self, next: SyncStatus) -> QueueResult<Self> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        Ok(self)
    }
}
