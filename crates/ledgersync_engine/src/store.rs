//! Local durable store contract and in-memory implementation.

use chrono::{DateTime, Utc};
use ledgersync_queue::{DeadLetterEntry, QueueItem};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a local durable store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The underlying storage backend failed (disk full, corruption, ...).
    #[error("storage backend error: {message}")]
    Backend {
        /// Backend error text.
        message: String,
    },

    /// The backend is temporarily unavailable (lock contention, busy).
    #[error("storage busy: {message}")]
    Busy {
        /// Backend error text.
        message: String,
    },

    /// A record or dead-letter entry was not found.
    #[error("not found: {id}")]
    NotFound {
        /// The missing id.
        id: String,
    },

    /// A persisted row could not be decoded.
    #[error("corrupt record: {message}")]
    Corrupt {
        /// Decode error text.
        message: String,
    },
}

impl StoreError {
    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a busy error.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a corrupt-record error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Returns true if the operation can be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy { .. })
    }
}

/// An append-only audit row.
///
/// Written for traceability on every enqueue and terminal transition; never
/// read back by the engine itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Row id.
    pub id: String,
    /// The acting principal.
    pub user_id: String,
    /// Table/collection the audited action targeted.
    pub target_table: String,
    /// Record id within the table.
    pub record_id: String,
    /// Action code (ENQUEUED, SYNCED, DEAD_LETTERED, ...).
    pub action: String,
    /// JSON snapshot of the new state.
    pub new_value: serde_json::Value,
    /// When the row was written.
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Creates a new audit row.
    pub fn new(
        user_id: impl Into<String>,
        target_table: impl Into<String>,
        record_id: impl Into<String>,
        action: impl Into<String>,
        new_value: serde_json::Value,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            target_table: target_table.into(),
            record_id: record_id.into(),
            action: action.into(),
            new_value,
            recorded_at,
        }
    }
}

/// Counts exposed through the health surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Items still in the active queue.
    pub pending: u64,
    /// Unresolved dead-letter entries.
    pub dead_letters: u64,
}

/// The durable store the orchestrator drains.
///
/// The store is the single source of truth for queue state. Implementations
/// must make `update_item` an atomic read-modify-write keyed by
/// `operation_id` so concurrent dispatchers cannot lose updates.
pub trait LocalStore: Send + Sync {
    /// Durably inserts a queue item.
    fn insert_item(&self, item: &QueueItem) -> StoreResult<()>;

    /// Replaces the stored state of an item, keyed by `operation_id`.
    fn update_item(&self, item: &QueueItem) -> StoreResult<()>;

    /// Returns every item in the active queue, ordered by ascending
    /// `priority` then ascending `created_at`.
    fn active_items(&self) -> StoreResult<Vec<QueueItem>>;

    /// Removes an item from the active queue.
    fn delete_item(&self, operation_id: &str) -> StoreResult<()>;

    /// Marks the business document as synced in the local schema at the
    /// given time. The caller supplies the timestamp so the store never
    /// reads the system clock itself.
    fn mark_document_synced(
        &self,
        collection: &str,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Inserts a dead-letter entry.
    fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> StoreResult<()>;

    /// Marks a dead-letter entry resolved without deleting it.
    fn resolve_dead_letter(&self, id: &str, note: &str, now: DateTime<Utc>) -> StoreResult<()>;

    /// Lists unresolved dead letters for one tenant.
    fn unresolved_dead_letters(&self, owner_id: &str) -> StoreResult<Vec<DeadLetterEntry>>;

    /// Appends an audit row.
    fn insert_audit(&self, record: &AuditRecord) -> StoreResult<()>;

    /// Returns the counts behind the health surface.
    fn queue_counts(&self) -> StoreResult<QueueCounts>;
}

/// An in-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<Vec<QueueItem>>,
    dead_letters: RwLock<Vec<DeadLetterEntry>>,
    audit: RwLock<Vec<AuditRecord>>,
    synced_documents: RwLock<Vec<(String, String, DateTime<Utc>)>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail with a backend error, for zero-loss tests.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Returns every audit row written so far.
    pub fn audit_rows(&self) -> Vec<AuditRecord> {
        self.audit.read().clone()
    }

    /// Returns the documents marked synced, in order.
    pub fn synced_documents(&self) -> Vec<(String, String)> {
        self.synced_documents
            .read()
            .iter()
            .map(|(collection, document_id, _)| (collection.clone(), document_id.clone()))
            .collect()
    }

    /// Returns when a document was last marked synced, if ever.
    pub fn document_synced_at(&self, collection: &str, document_id: &str) -> Option<DateTime<Utc>> {
        self.synced_documents
            .read()
            .iter()
            .rev()
            .find(|(c, d, _)| c == collection && d == document_id)
            .map(|(_, _, at)| *at)
    }

    /// Returns every dead-letter entry, resolved or not.
    pub fn all_dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.read().clone()
    }

    /// Looks up a live item by operation id.
    pub fn get_item(&self, operation_id: &str) -> Option<QueueItem> {
        self.items
            .read()
            .iter()
            .find(|item| item.operation_id == operation_id)
            .cloned()
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            Err(StoreError::backend("simulated write failure"))
        } else {
            Ok(())
        }
    }
}

impl LocalStore for MemoryStore {
    fn insert_item(&self, item: &QueueItem) -> StoreResult<()> {
        self.check_writable()?;
        let mut items = self.items.write();
        // Same uniqueness rule the SQLite store enforces via PRIMARY KEY.
        if items
            .iter()
            .any(|existing| existing.operation_id == item.operation_id)
        {
            return Err(StoreError::backend(format!(
                "duplicate operation_id: {}",
                item.operation_id
            )));
        }
        items.push(item.clone());
        Ok(())
    }

    fn update_item(&self, item: &QueueItem) -> StoreResult<()> {
        self.check_writable()?;
        let mut items = self.items.write();
        let slot = items
            .iter_mut()
            .find(|existing| existing.operation_id == item.operation_id)
            .ok_or_else(|| StoreError::not_found(item.operation_id.clone()))?;
        *slot = item.clone();
        Ok(())
    }

    fn active_items(&self) -> StoreResult<Vec<QueueItem>> {
        let mut items = self.items.read().clone();
        items.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(items)
    }

    fn delete_item(&self, operation_id: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.items
            .write()
            .retain(|item| item.operation_id != operation_id);
        Ok(())
    }

    fn mark_document_synced(
        &self,
        collection: &str,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_writable()?;
        self.synced_documents
            .write()
            .push((collection.to_string(), document_id.to_string(), now));
        Ok(())
    }

    fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> StoreResult<()> {
        self.check_writable()?;
        self.dead_letters.write().push(entry.clone());
        Ok(())
    }

    fn resolve_dead_letter(&self, id: &str, note: &str, now: DateTime<Utc>) -> StoreResult<()> {
        self.check_writable()?;
        let mut entries = self.dead_letters.write();
        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| StoreError::not_found(id))?;
        entry.resolved_at = Some(now);
        entry.resolution_note = Some(note.to_string());
        Ok(())
    }

    fn unresolved_dead_letters(&self, owner_id: &str) -> StoreResult<Vec<DeadLetterEntry>> {
        Ok(self
            .dead_letters
            .read()
            .iter()
            .filter(|entry| entry.owner_id == owner_id && entry.is_unresolved())
            .cloned()
            .collect())
    }

    fn insert_audit(&self, record: &AuditRecord) -> StoreResult<()> {
        self.check_writable()?;
        self.audit.write().push(record.clone());
        Ok(())
    }

    fn queue_counts(&self) -> StoreResult<QueueCounts> {
        Ok(QueueCounts {
            pending: self.items.read().len() as u64,
            dead_letters: self
                .dead_letters
                .read()
                .iter()
                .filter(|entry| entry.is_unresolved())
                .count() as u64,
        })
    }
}
