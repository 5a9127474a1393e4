//! Schema migrations.

use ledgersync_engine::{StoreError, StoreResult};
use rusqlite::Connection;

/// Current schema version, tracked via `PRAGMA user_version`.
const CURRENT_VERSION: i32 = 1;

/// Runs all pending migrations.
pub fn run(conn: &Connection) -> StoreResult<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|err| StoreError::backend(err.to_string()))?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    if version < CURRENT_VERSION {
        conn.pragma_update(None, "user_version", CURRENT_VERSION)
            .map_err(|err| StoreError::backend(err.to_string()))?;
    }

    Ok(())
}

/// Initial schema: queue, dead letters, audit trail, document sync marks.
fn migrate_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS sync_queue (
            operation_id TEXT PRIMARY KEY,
            op_type TEXT NOT NULL,
            collection TEXT NOT NULL,
            document_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            user_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 100,
            created_at INTEGER NOT NULL,
            last_attempt_at INTEGER,
            last_error TEXT,
            step_number INTEGER NOT NULL DEFAULT 1,
            total_steps INTEGER NOT NULL DEFAULT 1,
            parent_operation_id TEXT,
            dependency_group TEXT,
            synced_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_queue_order
            ON sync_queue(priority, created_at);
        CREATE INDEX IF NOT EXISTS idx_queue_group
            ON sync_queue(dependency_group, step_number);

        CREATE TABLE IF NOT EXISTS dead_letters (
            id TEXT PRIMARY KEY,
            original_operation_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            op_type TEXT NOT NULL,
            collection TEXT NOT NULL,
            document_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            failure_reason TEXT NOT NULL,
            total_attempts INTEGER NOT NULL,
            first_attempt_at INTEGER NOT NULL,
            last_attempt_at INTEGER NOT NULL,
            moved_at INTEGER NOT NULL,
            resolved_at INTEGER,
            resolution_note TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_dead_letters_owner
            ON dead_letters(owner_id, resolved_at);

        CREATE TABLE IF NOT EXISTS audit_log (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            target_table TEXT NOT NULL,
            record_id TEXT NOT NULL,
            action TEXT NOT NULL,
            new_value TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS document_sync_state (
            collection TEXT NOT NULL,
            document_id TEXT NOT NULL,
            synced_at INTEGER NOT NULL,
            PRIMARY KEY (collection, document_id)
        );
        COMMIT;",
    )
    .map_err(|err| StoreError::backend(err.to_string()))
}
