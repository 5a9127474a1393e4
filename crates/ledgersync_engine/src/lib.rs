//! # LedgerSync Engine
//!
//! Sync orchestrator for the LedgerSync outbox queue.
//!
//! This crate provides:
//! - `SyncOrchestrator`: the dispatch loop driving every queue item through
//!   the status state machine to a terminal or retry state
//! - `LocalStore`: the durable store contract (queue, dead letters, audit)
//! - `RemoteClient`: the remote commit contract, tenant-scoped
//! - `ConflictPolicy`: pluggable conflict resolution (default: server wins)
//! - `Clock`: injectable time source for deterministic tests
//! - In-memory store and scripted remote for tests and embedding
//!
//! ## Architecture
//!
//! The orchestrator implements the **outbox pattern**: a business mutation
//! and its queue record are committed in one local transaction, so a locally
//! committed change always has a durable sync record. The orchestrator later
//! drains the store in (priority, creation time) order and dispatches each
//! eligible record to the remote client.
//!
//! ## Key invariants
//!
//! - An item is durably persisted before any network attempt
//! - Records sharing a dependency group are delivered in step order
//! - Records targeting the same document are delivered in creation order
//! - Transient failures back off exponentially; the retry budget is finite
//! - Nothing is silently dropped: exhaustion and permanent failures park the
//!   record in the dead-letter store with its full attempt history

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod conflict;
mod error;
mod orchestrator;
mod remote;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use conflict::{ClientWins, ConflictDecision, ConflictPolicy, ManualResolution, ServerWins};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{CycleStats, EngineStats, HealthReport, SyncOrchestrator};
pub use remote::{CommitOutcome, RemoteClient, ScriptedRemote};
pub use store::{AuditRecord, LocalStore, MemoryStore, QueueCounts, StoreError, StoreResult};
