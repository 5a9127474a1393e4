//! Remote sync client contract.

use ledgersync_queue::{Payload, QueueItem};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Outcome of committing one queue item to the shared backend.
///
/// This is the whole failure taxonomy the orchestrator distinguishes;
/// anything the client cannot classify should be reported as transient so
/// the retry budget, not the client, decides when to give up.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The remote store accepted the operation.
    Success,
    /// Remote state has diverged from the version this record assumed.
    /// Carries the server's current payload for policy resolution.
    Conflict(Payload),
    /// Network/timeout/server-busy; worth retrying with backoff.
    Transient(String),
    /// Validation or auth rejection; retrying cannot help.
    Permanent(String),
}

/// Commits queue items to the shared backend.
///
/// The client is stateless from the orchestrator's perspective: all retry
/// state lives in the local store. Implementations must namespace every
/// write by `item.owner_id`; that contract is what makes cross-tenant
/// writes structurally unreachable.
pub trait RemoteClient: Send + Sync {
    /// Commits one item, reporting the outcome.
    fn commit(&self, item: &QueueItem) -> impl std::future::Future<Output = CommitOutcome> + Send;
}

/// A scripted remote for testing.
///
/// Outcomes are served from a queue in order; once the script is exhausted
/// every commit succeeds. Every received item is recorded.
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<VecDeque<CommitOutcome>>,
    received: Mutex<Vec<QueueItem>>,
}

impl ScriptedRemote {
    /// Creates a remote that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an outcome to the script.
    pub fn push_outcome(&self, outcome: CommitOutcome) {
        self.script.lock().push_back(outcome);
    }

    /// Appends the same outcome `count` times.
    pub fn push_outcomes(&self, outcome: CommitOutcome, count: usize) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(outcome.clone());
        }
    }

    /// Returns every item received so far, in order.
    pub fn received(&self) -> Vec<QueueItem> {
        self.received.lock().clone()
    }

    /// Returns how many commits were attempted.
    pub fn commit_count(&self) -> usize {
        self.received.lock().len()
    }
}

impl RemoteClient for ScriptedRemote {
    async fn commit(&self, item: &QueueItem) -> CommitOutcome {
        self.received.lock().push(item.clone());
        self.script
            .lock()
            .pop_front()
            .unwrap_or(CommitOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ledgersync_queue::OperationType;

    fn sample_item() -> QueueItem {
        QueueItem::create(
            "user_1",
            "owner_1",
            OperationType::Create,
            "bills",
            "bill_1",
            Payload::new(),
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn scripted_outcomes_served_in_order() {
        let remote = ScriptedRemote::new();
        remote.push_outcome(CommitOutcome::Transient("timeout".into()));
        remote.push_outcome(CommitOutcome::Success);

        let item = sample_item();
        assert_eq!(
            remote.commit(&item).await,
            CommitOutcome::Transient("timeout".into())
        );
        assert_eq!(remote.commit(&item).await, CommitOutcome::Success);
        // Exhausted script defaults to success.
        assert_eq!(remote.commit(&item).await, CommitOutcome::Success);
        assert_eq!(remote.commit_count(), 3);
    }
}
