//! # LedgerSync Store
//!
//! SQLite-backed implementation of the engine's `LocalStore` contract.
//!
//! The store owns the `sync_queue`, `dead_letters`, and `audit_log` tables,
//! plus a minimal `document_sync_state` table backing
//! `mark_document_synced`. Business tables live in the host application's
//! own schema; pairing a business write with `insert_item` in one SQLite
//! transaction is what gives the outbox its zero-loss property.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod schema;
mod sqlite_store;

pub use sqlite_store::SqliteStore;
