//! Pluggable conflict resolution.
//!
//! Which side wins when remote state has diverged is business-sensitive, so
//! the choice is a strategy injected into the orchestrator rather than a
//! hard-coded branch.

use ledgersync_queue::{Payload, QueueItem};

/// What the orchestrator should do with a conflicted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Discard the local write and mark the item synced without applying it.
    DiscardLocal,
    /// Route the item through the normal transient-retry path so the local
    /// write is re-attempted.
    RetryLocal,
    /// Park the item in the dead-letter store for operator review.
    Escalate,
}

/// Decides the outcome of a detected conflict.
pub trait ConflictPolicy: Send + Sync {
    /// Resolves a conflict between the item and the server's current payload.
    fn resolve(&self, item: &QueueItem, server_payload: &Payload) -> ConflictDecision;

    /// Policy name, used in logs and dead-letter reasons.
    fn name(&self) -> &'static str;
}

/// Default policy: the server's version stands, the local write is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerWins;

impl ConflictPolicy for ServerWins {
    fn resolve(&self, _item: &QueueItem, _server_payload: &Payload) -> ConflictDecision {
        ConflictDecision::DiscardLocal
    }

    fn name(&self) -> &'static str {
        "server-wins"
    }
}

/// The local write is re-attempted until it lands or the budget runs out.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientWins;

impl ConflictPolicy for ClientWins {
    fn resolve(&self, _item: &QueueItem, _server_payload: &Payload) -> ConflictDecision {
        ConflictDecision::RetryLocal
    }

    fn name(&self) -> &'static str {
        "client-wins"
    }
}

/// Every conflict is handed to an operator via the dead-letter store.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualResolution;

impl ConflictPolicy for ManualResolution {
    fn resolve(&self, _item: &QueueItem, _server_payload: &Payload) -> ConflictDecision {
        ConflictDecision::Escalate
    }

    fn name(&self) -> &'static str {
        "manual"
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
            OperationType::Update,
            "bills",
            "bill_1",
            Payload::new(),
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        )
    }

    #[test]
    fn builtin_policies() {
        let item = sample_item();
        let server = Payload::new();

        assert_eq!(
            ServerWins.resolve(&item, &server),
            ConflictDecision::DiscardLocal
        );
        assert_eq!(
            ClientWins.resolve(&item, &server),
            ConflictDecision::RetryLocal
        );
        assert_eq!(
            ManualResolution.resolve(&item, &server),
            ConflictDecision::Escalate
        );
    }
}
