//! SQLite-backed `LocalStore`.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use ledgersync_engine::{AuditRecord, LocalStore, QueueCounts, StoreError, StoreResult};
use ledgersync_queue::{DeadLetterEntry, OperationType, Payload, QueueItem, SyncStatus};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::schema;

/// A durable store backed by a single SQLite database.
///
/// The connection sits behind a mutex, so every operation is a serialized,
/// single-statement transaction: `update_item` is an atomic
/// read-modify-write keyed by `operation_id`, as the engine contract
/// requires.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(db_err)?;
        schema::run(&conn)?;
        debug!(path = %path.as_ref().display(), "opened sync store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory store, mainly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        schema::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Returns when the document was last marked synced, if ever.
    pub fn document_synced_at(
        &self,
        collection: &str,
        document_id: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let millis: Option<i64> = conn
            .query_row(
                "SELECT synced_at FROM document_sync_state
                 WHERE collection = ?1 AND document_id = ?2",
                params![collection, document_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(db_err(other)),
            })?;
        millis.map(from_millis).transpose()
    }

    /// Returns the number of audit rows written.
    pub fn audit_row_count(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|count| count as u64)
        .map_err(db_err)
    }
}

impl LocalStore for SqliteStore {
    fn insert_item(&self, item: &QueueItem) -> StoreResult<()> {
        let payload = serde_json::to_string(&item.payload)
            .map_err(|err| StoreError::corrupt(err.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_queue (
                operation_id, op_type, collection, document_id, payload,
                payload_hash, user_id, owner_id, status, retry_count,
                priority, created_at, last_attempt_at, last_error,
                step_number, total_steps, parent_operation_id,
                dependency_group, synced_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                      ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                item.operation_id,
                item.op_type.as_str(),
                item.collection,
                item.document_id,
                payload,
                item.payload_hash,
                item.user_id,
                item.owner_id,
                item.status.as_str(),
                item.retry_count,
                item.priority,
                to_millis(item.created_at),
                item.last_attempt_at.map(to_millis),
                item.last_error,
                item.step_number,
                item.total_steps,
                item.parent_operation_id,
                item.dependency_group,
                item.synced_at.map(to_millis),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn update_item(&self, item: &QueueItem) -> StoreResult<()> {
        let payload = serde_json::to_string(&item.payload)
            .map_err(|err| StoreError::corrupt(err.to_string()))?;
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE sync_queue SET
                    op_type = ?2, collection = ?3, document_id = ?4,
                    payload = ?5, payload_hash = ?6, user_id = ?7,
                    owner_id = ?8, status = ?9, retry_count = ?10,
                    priority = ?11, created_at = ?12, last_attempt_at = ?13,
                    last_error = ?14, step_number = ?15, total_steps = ?16,
                    parent_operation_id = ?17, dependency_group = ?18,
                    synced_at = ?19
                 WHERE operation_id = ?1",
                params![
                    item.operation_id,
                    item.op_type.as_str(),
                    item.collection,
                    item.document_id,
                    payload,
                    item.payload_hash,
                    item.user_id,
                    item.owner_id,
                    item.status.as_str(),
                    item.retry_count,
                    item.priority,
                    to_millis(item.created_at),
                    item.last_attempt_at.map(to_millis),
                    item.last_error,
                    item.step_number,
                    item.total_steps,
                    item.parent_operation_id,
                    item.dependency_group,
                    item.synced_at.map(to_millis),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StoreError::not_found(item.operation_id.clone()));
        }
        Ok(())
    }

    fn active_items(&self) -> StoreResult<Vec<QueueItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT operation_id, op_type, collection, document_id,
                        payload, payload_hash, user_id, owner_id, status,
                        retry_count, priority, created_at, last_attempt_at,
                        last_error, step_number, total_steps,
                        parent_operation_id, dependency_group, synced_at
                 FROM sync_queue
                 ORDER BY priority ASC, created_at ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], read_queue_row)
            .map_err(db_err)?
            .collect::<Result<Vec<QueueRow>, _>>()
            .map_err(db_err)?;

        rows.into_iter().map(item_from_row).collect()
    }

    fn delete_item(&self, operation_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM sync_queue WHERE operation_id = ?1",
            params![operation_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn mark_document_synced(
        &self,
        collection: &str,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO document_sync_state (collection, document_id, synced_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, document_id) DO UPDATE SET synced_at = ?3",
            params![collection, document_id, to_millis(now)],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> StoreResult<()> {
        let payload = serde_json::to_string(&entry.payload)
            .map_err(|err| StoreError::corrupt(err.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO dead_letters (
                id, original_operation_id, user_id, owner_id, op_type,
                collection, document_id, payload, failure_reason,
                total_attempts, first_attempt_at, last_attempt_at, moved_at,
                resolved_at, resolution_note
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                      ?13, ?14, ?15)",
            params![
                entry.id,
                entry.original_operation_id,
                entry.user_id,
                entry.owner_id,
                entry.op_type.as_str(),
                entry.collection,
                entry.document_id,
                payload,
                entry.failure_reason,
                entry.total_attempts,
                to_millis(entry.first_attempt_at),
                to_millis(entry.last_attempt_at),
                to_millis(entry.moved_at),
                entry.resolved_at.map(to_millis),
                entry.resolution_note,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn resolve_dead_letter(&self, id: &str, note: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE dead_letters SET resolved_at = ?2, resolution_note = ?3
                 WHERE id = ?1",
                params![id, to_millis(now), note],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StoreError::not_found(id));
        }
        Ok(())
    }

    fn unresolved_dead_letters(&self, owner_id: &str) -> StoreResult<Vec<DeadLetterEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, original_operation_id, user_id, owner_id, op_type,
                        collection, document_id, payload, failure_reason,
                        total_attempts, first_attempt_at, last_attempt_at,
                        moved_at, resolved_at, resolution_note
                 FROM dead_letters
                 WHERE owner_id = ?1 AND resolved_at IS NULL
                 ORDER BY moved_at ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![owner_id], read_dead_letter_row)
            .map_err(db_err)?
            .collect::<Result<Vec<DeadLetterRow>, _>>()
            .map_err(db_err)?;

        rows.into_iter().map(dead_letter_from_row).collect()
    }

    fn insert_audit(&self, record: &AuditRecord) -> StoreResult<()> {
        let new_value = serde_json::to_string(&record.new_value)
            .map_err(|err| StoreError::corrupt(err.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_log (id, user_id, target_table, record_id,
                                    action, new_value, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.user_id,
                record.target_table,
                record.record_id,
                record.action,
                new_value,
                to_millis(record.recorded_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn queue_counts(&self) -> StoreResult<QueueCounts> {
        let conn = self.conn.lock();
        let pending: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
            .map_err(db_err)?;
        let dead_letters: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM dead_letters WHERE resolved_at IS NULL",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(QueueCounts {
            pending: pending as u64,
            dead_letters: dead_letters as u64,
        })
    }
}

/// Raw queue columns before decoding.
struct QueueRow {
    operation_id: String,
    op_type: String,
    collection: String,
    document_id: String,
    payload: String,
    payload_hash: String,
    user_id: String,
    owner_id: String,
    status: String,
    retry_count: i64,
    priority: i64,
    created_at: i64,
    last_attempt_at: Option<i64>,
    last_error: Option<String>,
    step_number: i64,
    total_steps: i64,
    parent_operation_id: Option<String>,
    dependency_group: Option<String>,
    synced_at: Option<i64>,
}

fn read_queue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueRow> {
    Ok(QueueRow {
        operation_id: row.get(0)?,
        op_type: row.get(1)?,
        collection: row.get(2)?,
        document_id: row.get(3)?,
        payload: row.get(4)?,
        payload_hash: row.get(5)?,
        user_id: row.get(6)?,
        owner_id: row.get(7)?,
        status: row.get(8)?,
        retry_count: row.get(9)?,
        priority: row.get(10)?,
        created_at: row.get(11)?,
        last_attempt_at: row.get(12)?,
        last_error: row.get(13)?,
        step_number: row.get(14)?,
        total_steps: row.get(15)?,
        parent_operation_id: row.get(16)?,
        dependency_group: row.get(17)?,
        synced_at: row.get(18)?,
    })
}

fn item_from_row(row: QueueRow) -> StoreResult<QueueItem> {
    let status = SyncStatus::parse(&row.status)
        .ok_or_else(|| StoreError::corrupt(format!("unknown status: {}", row.status)))?;
    let payload: Payload = serde_json::from_str(&row.payload)
        .map_err(|err| StoreError::corrupt(format!("payload: {err}")))?;

    Ok(QueueItem {
        operation_id: row.operation_id,
        op_type: OperationType::parse(&row.op_type),
        collection: row.collection,
        document_id: row.document_id,
        payload,
        payload_hash: row.payload_hash,
        user_id: row.user_id,
        owner_id: row.owner_id,
        status,
        retry_count: to_u32(row.retry_count)?,
        priority: to_i32(row.priority)?,
        created_at: from_millis(row.created_at)?,
        last_attempt_at: row.last_attempt_at.map(from_millis).transpose()?,
        last_error: row.last_error,
        step_number: to_u32(row.step_number)?,
        total_steps: to_u32(row.total_steps)?,
        parent_operation_id: row.parent_operation_id,
        dependency_group: row.dependency_group,
        synced_at: row.synced_at.map(from_millis).transpose()?,
    })
}

/// Raw dead-letter columns before decoding.
struct DeadLetterRow {
    id: String,
    original_operation_id: String,
    user_id: String,
    owner_id: String,
    op_type: String,
    collection: String,
    document_id: String,
    payload: String,
    failure_reason: String,
    total_attempts: i64,
    first_attempt_at: i64,
    last_attempt_at: i64,
    moved_at: i64,
    resolved_at: Option<i64>,
    resolution_note: Option<String>,
}

fn read_dead_letter_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeadLetterRow> {
    Ok(DeadLetterRow {
        id: row.get(0)?,
        original_operation_id: row.get(1)?,
        user_id: row.get(2)?,
        owner_id: row.get(3)?,
        op_type: row.get(4)?,
        collection: row.get(5)?,
        document_id: row.get(6)?,
        payload: row.get(7)?,
        failure_reason: row.get(8)?,
        total_attempts: row.get(9)?,
        first_attempt_at: row.get(10)?,
        last_attempt_at: row.get(11)?,
        moved_at: row.get(12)?,
        resolved_at: row.get(13)?,
        resolution_note: row.get(14)?,
    })
}

fn dead_letter_from_row(row: DeadLetterRow) -> StoreResult<DeadLetterEntry> {
    let payload: Payload = serde_json::from_str(&row.payload)
        .map_err(|err| StoreError::corrupt(format!("payload: {err}")))?;

    Ok(DeadLetterEntry {
        id: row.id,
        original_operation_id: row.original_operation_id,
        user_id: row.user_id,
        owner_id: row.owner_id,
        op_type: OperationType::parse(&row.op_type),
        collection: row.collection,
        document_id: row.document_id,
        payload,
        failure_reason: row.failure_reason,
        total_attempts: to_u32(row.total_attempts)?,
        first_attempt_at: from_millis(row.first_attempt_at)?,
        last_attempt_at: from_millis(row.last_attempt_at)?,
        moved_at: from_millis(row.moved_at)?,
        resolved_at: row.resolved_at.map(from_millis).transpose()?,
        resolution_note: row.resolution_note,
    })
}

fn db_err(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::busy(err.to_string())
        }
        _ => StoreError::backend(err.to_string()),
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::corrupt(format!("timestamp out of range: {millis}")))
}

fn to_u32(value: i64) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::corrupt(format!("count out of range: {value}")))
}

fn to_i32(value: i64) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::corrupt(format!("priority out of range: {value}")))
}
