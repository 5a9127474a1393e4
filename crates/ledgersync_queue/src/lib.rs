//! # LedgerSync Queue
//!
//! Operation records and policies for the LedgerSync outbox queue.
//!
//! This crate provides:
//! - `QueueItem`: the durable operation record and its status lifecycle
//! - `BackoffPolicy`: retry scheduling and dead-letter eligibility
//! - `MultiStepOp`: composition of causally ordered operation groups
//! - `DeadLetterEntry`: the manually reconcilable parking record
//! - Canonical payload hashing for idempotency and conflict comparison
//!
//! This is a pure value-type crate with no I/O operations. Records are
//! immutable-with-copy: every lifecycle transition consumes the record and
//! returns a new one, so no caller ever observes a half-applied mutation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod dead_letter;
mod error;
mod hash;
mod multi_step;
mod operation;

pub use backoff::BackoffPolicy;
pub use dead_letter::DeadLetterEntry;
pub use error::{QueueError, QueueResult};
pub use hash::{canonical_payload_hash, operation_id_for};
pub use multi_step::{MultiStepOp, OperationStep};
pub use operation::{OperationType, Payload, QueueItem, SyncStatus};
