//! The sync orchestrator: queue drain, dispatch, and escalation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use ledgersync_queue::{DeadLetterEntry, MultiStepOp, QueueItem, SyncStatus};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::conflict::{ConflictDecision, ConflictPolicy, ServerWins};
use crate::error::{SyncError, SyncResult};
use crate::remote::{CommitOutcome, RemoteClient};
use crate::store::{AuditRecord, LocalStore};

/// Counters for one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Items handed to the remote client.
    pub dispatched: u64,
    /// Items that reached `Synced`.
    pub synced: u64,
    /// Items returned to `Retry`.
    pub retried: u64,
    /// Conflicts reported by the remote.
    pub conflicts: u64,
    /// Items escalated to the dead-letter store.
    pub dead_lettered: u64,
    /// Items skipped as ineligible (backoff, group order, document order).
    pub skipped: u64,
}

impl CycleStats {
    fn merge(&mut self, other: &CycleStats) {
        self.dispatched += other.dispatched;
        self.synced += other.synced;
        self.retried += other.retried;
        self.conflicts += other.conflicts;
        self.dead_lettered += other.dead_lettered;
        self.skipped += other.skipped;
    }
}

/// Cumulative statistics across cycles.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Cycles completed.
    pub cycles_completed: u64,
    /// Total items synced.
    pub operations_synced: u64,
    /// Total transient retries recorded.
    pub operations_retried: u64,
    /// Total conflicts encountered.
    pub conflicts_encountered: u64,
    /// Total items dead-lettered.
    pub operations_dead_lettered: u64,
    /// Total stale in-progress records recovered.
    pub stale_recovered: u64,
}

/// The monitoring surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    /// True while no dead letter requires attention.
    pub healthy: bool,
    /// Items in the active queue.
    pub pending_count: u64,
    /// Unresolved dead-letter entries.
    pub dead_letter_count: u64,
}

/// Drains the local durable store against the remote client.
///
/// The orchestrator owns no global state: it is constructed with an injected
/// store, remote client, and clock, so multiple orchestrators can coexist
/// and tests can substitute fakes for all three.
///
/// Dispatch is a sequential cooperative loop. Per-document and per-group
/// ordering are therefore structural: at most one record per document and
/// per dependency group is dispatched in a cycle, and only the earliest
/// eligible one.
pub struct SyncOrchestrator<S, R, C> {
    store: S,
    remote: R,
    clock: C,
    config: EngineConfig,
    conflict_policy: Box<dyn ConflictPolicy>,
    stats: RwLock<EngineStats>,
    cancelled: AtomicBool,
}

impl<S: LocalStore, R: RemoteClient, C: Clock> SyncOrchestrator<S, R, C> {
    /// Creates an orchestrator with the default server-wins conflict policy.
    pub fn new(store: S, remote: R, clock: C, config: EngineConfig) -> Self {
        Self {
            store,
            remote,
            clock,
            config,
            conflict_policy: Box::new(ServerWins),
            stats: RwLock::new(EngineStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Replaces the conflict policy.
    pub fn with_conflict_policy(mut self, policy: impl ConflictPolicy + 'static) -> Self {
        self.conflict_policy = Box::new(policy);
        self
    }

    /// Returns cumulative statistics.
    pub fn stats(&self) -> EngineStats {
        self.stats.read().clone()
    }

    /// Returns a borrow of the injected store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns a borrow of the injected remote client.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Returns a borrow of the injected clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Consumes the orchestrator, returning the store.
    ///
    /// Used when one process incarnation hands the durable queue to the
    /// next, as a crash/restart does.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Requests that the continuous loop stop after the current cycle.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Durably enqueues a record before any network attempt.
    ///
    /// This ordering is the zero-data-loss guarantee: callers pair the
    /// business mutation and this insert in one local transaction, so a
    /// locally committed change always has a durable sync record. A store
    /// failure here propagates; the mutation must not be reported committed.
    pub fn enqueue(&self, item: QueueItem) -> SyncResult<()> {
        self.store.insert_item(&item)?;
        self.audit(&item, "ENQUEUED")?;
        debug!(
            operation_id = %item.operation_id,
            collection = %item.collection,
            op_type = %item.op_type.as_str(),
            "enqueued"
        );
        if item.op_type.is_unknown() {
            warn!(
                operation_id = %item.operation_id,
                op_type = %item.op_type.as_str(),
                "enqueued item carries unrecognized operation type"
            );
        }
        Ok(())
    }

    /// Composes and enqueues a multi-step operation.
    ///
    /// Returns the operation ids in step order.
    pub fn enqueue_group(&self, group: &MultiStepOp, priority: i32) -> SyncResult<Vec<String>> {
        let items = group.queue_items(priority)?;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            ids.push(item.operation_id.clone());
            self.enqueue(item)?;
        }
        info!(
            parent_operation_id = %group.parent_operation_id,
            steps = ids.len(),
            "enqueued multi-step operation"
        );
        Ok(ids)
    }

    /// Re-evaluates `InProgress` records abandoned by a dead process.
    ///
    /// Any in-progress record older than the staleness threshold is treated
    /// as having failed its attempt: returned to `Retry` (or escalated if
    /// its budget is exhausted), never silently dropped, never assumed
    /// synced. Call once on startup before the first cycle.
    pub fn recover_stale(&self) -> SyncResult<u64> {
        let now = self.clock.now();
        let mut recovered = 0;

        for item in self.store.active_items()? {
            if item.status != SyncStatus::InProgress {
                continue;
            }
            let is_stale = item
                .last_attempt_at
                .map_or(true, |at| now - at >= self.config.stale_after);
            if !is_stale {
                continue;
            }

            warn!(
                operation_id = %item.operation_id,
                "recovering stale in-progress record"
            );
            let retrying = item.record_failure("attempt interrupted by restart", now)?;
            if self.config.backoff.should_dead_letter(&retrying) {
                self.dead_letter(retrying, "retry budget exhausted after interrupted attempt")?;
            } else {
                self.store.update_item(&retrying)?;
            }
            recovered += 1;
        }

        if recovered > 0 {
            self.stats.write().stale_recovered += recovered;
        }
        Ok(recovered)
    }

    /// Runs dispatch cycles until the queue has nothing eligible.
    pub async fn drain(&self) -> SyncResult<CycleStats> {
        let mut total = CycleStats::default();
        loop {
            let cycle = self.run_cycle().await?;
            if cycle.dispatched == 0 {
                total.skipped += cycle.skipped;
                return Ok(total);
            }
            total.merge(&cycle);
        }
    }

    /// Runs the continuous loop: recover, then cycle at the poll interval
    /// until cancelled.
    pub async fn run(&self) -> SyncResult<()> {
        self.recover_stale()?;
        loop {
            self.check_cancelled()?;
            let stats = self.run_cycle().await?;
            if stats.dispatched > 0 {
                info!(
                    synced = stats.synced,
                    retried = stats.retried,
                    dead_lettered = stats.dead_lettered,
                    "sync cycle complete"
                );
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Performs one dispatch cycle over the eligible queue items.
    ///
    /// Eligibility per item: status `Pending`, or `Retry` once its backoff
    /// deadline has elapsed; no earlier live step in its dependency group;
    /// no earlier live record for its `(collection, document)`. The group
    /// check is an explicit scheduler decision rather than a reliance on
    /// insertion order, since a persisted queue can be reordered by the
    /// store between runs.
    pub async fn run_cycle(&self) -> SyncResult<CycleStats> {
        let mut stats = CycleStats::default();
        let items = self.store.active_items()?;

        // Earliest live step per dependency group; a later step is never
        // attempted while an earlier one is still live.
        let mut first_live_step: HashMap<String, u32> = HashMap::new();
        // Earliest creation time per document; remote writes must observe
        // the same causal order as local writes.
        let mut first_created: HashMap<(String, String), DateTime<Utc>> = HashMap::new();
        for item in &items {
            if let Some(group) = &item.dependency_group {
                let entry = first_live_step
                    .entry(group.clone())
                    .or_insert(item.step_number);
                *entry = (*entry).min(item.step_number);
            }
            let key = (item.collection.clone(), item.document_id.clone());
            let entry = first_created.entry(key).or_insert(item.created_at);
            *entry = (*entry).min(item.created_at);
        }

        // At most one dispatch per document and per group per cycle.
        let mut touched_docs: HashSet<(String, String)> = HashSet::new();
        let mut touched_groups: HashSet<String> = HashSet::new();

        for item in items {
            if stats.dispatched as usize >= self.config.batch_limit {
                break;
            }
            let now = self.clock.now();

            match item.status {
                SyncStatus::Pending => {}
                SyncStatus::Retry => {
                    if self.config.backoff.next_retry_time(&item) > now {
                        stats.skipped += 1;
                        continue;
                    }
                }
                // In-progress records belong to a live attempt or to
                // recover_stale; anything else has no business in the
                // active queue.
                _ => {
                    stats.skipped += 1;
                    continue;
                }
            }

            if let Some(group) = &item.dependency_group {
                let blocked = touched_groups.contains(group)
                    || first_live_step.get(group) != Some(&item.step_number);
                if blocked {
                    stats.skipped += 1;
                    continue;
                }
            }

            let doc_key = (item.collection.clone(), item.document_id.clone());
            if touched_docs.contains(&doc_key)
                || first_created.get(&doc_key) != Some(&item.created_at)
            {
                stats.skipped += 1;
                continue;
            }

            touched_docs.insert(doc_key);
            if let Some(group) = &item.dependency_group {
                touched_groups.insert(group.clone());
            }

            self.dispatch(item, now, &mut stats).await?;
        }

        {
            let mut engine = self.stats.write();
            engine.cycles_completed += 1;
            engine.operations_synced += stats.synced;
            engine.operations_retried += stats.retried;
            engine.conflicts_encountered += stats.conflicts;
            engine.operations_dead_lettered += stats.dead_lettered;
        }

        Ok(stats)
    }

    /// Dispatches one eligible item and applies its outcome.
    async fn dispatch(
        &self,
        item: QueueItem,
        now: DateTime<Utc>,
        stats: &mut CycleStats,
    ) -> SyncResult<()> {
        let in_flight = item.begin_attempt(now)?;
        // The attempt is durable before the network call so a crash mid-
        // commit leaves a recoverable InProgress record.
        self.store.update_item(&in_flight)?;
        stats.dispatched += 1;

        debug!(
            operation_id = %in_flight.operation_id,
            collection = %in_flight.collection,
            document_id = %in_flight.document_id,
            attempt = in_flight.retry_count + 1,
            "dispatching"
        );

        match self.remote.commit(&in_flight).await {
            CommitOutcome::Success => {
                self.finish_synced(in_flight, "SYNCED")?;
                stats.synced += 1;
            }
            CommitOutcome::Conflict(server_payload) => {
                stats.conflicts += 1;
                match self.conflict_policy.resolve(&in_flight, &server_payload) {
                    ConflictDecision::DiscardLocal => {
                        warn!(
                            operation_id = %in_flight.operation_id,
                            policy = self.conflict_policy.name(),
                            "conflict: discarding local write"
                        );
                        self.finish_synced(in_flight, "CONFLICT_DISCARDED")?;
                        stats.synced += 1;
                    }
                    ConflictDecision::RetryLocal => {
                        self.handle_transient(in_flight, "conflict: retrying local write", stats)?;
                    }
                    ConflictDecision::Escalate => {
                        let reason =
                            format!("unresolved conflict ({})", self.conflict_policy.name());
                        let failed = in_flight.abandon(&reason, self.clock.now())?;
                        self.dead_letter(failed, reason)?;
                        stats.dead_lettered += 1;
                    }
                }
            }
            CommitOutcome::Transient(reason) => {
                self.handle_transient(in_flight, &reason, stats)?;
            }
            CommitOutcome::Permanent(reason) => {
                let failed = in_flight.abandon(&reason, self.clock.now())?;
                self.dead_letter(failed, reason)?;
                stats.dead_lettered += 1;
            }
        }

        Ok(())
    }

    /// Records a transient failure, escalating once the budget is spent.
    fn handle_transient(
        &self,
        item: QueueItem,
        reason: &str,
        stats: &mut CycleStats,
    ) -> SyncResult<()> {
        let retrying = item.record_failure(reason, self.clock.now())?;
        if self.config.backoff.should_dead_letter(&retrying) {
            let reason = format!("retry budget exhausted: {reason}");
            self.dead_letter(retrying, reason)?;
            stats.dead_lettered += 1;
        } else {
            debug!(
                operation_id = %retrying.operation_id,
                retry_count = retrying.retry_count,
                next_attempt = %self.config.backoff.next_retry_time(&retrying),
                "transient failure, will retry"
            );
            self.store.update_item(&retrying)?;
            stats.retried += 1;
        }
        Ok(())
    }

    /// Completes a record: `Synced`, document marked, pruned from the queue.
    fn finish_synced(&self, item: QueueItem, action: &str) -> SyncResult<()> {
        let now = self.clock.now();
        let synced = item.complete(now)?;
        self.store
            .mark_document_synced(&synced.collection, &synced.document_id, now)?;
        self.store.delete_item(&synced.operation_id)?;
        self.audit(&synced, action)?;
        debug!(operation_id = %synced.operation_id, "synced");
        Ok(())
    }

    /// Parks a record in the dead-letter store with its full history.
    fn dead_letter(&self, item: QueueItem, reason: impl Into<String>) -> SyncResult<()> {
        let reason = reason.into();
        let now = self.clock.now();
        let entry = DeadLetterEntry::from_item(&item, reason.clone(), now);
        let dead = item.escalate()?;

        self.store.insert_dead_letter(&entry)?;
        self.store.delete_item(&dead.operation_id)?;
        self.audit(&dead, "DEAD_LETTERED")?;

        warn!(
            operation_id = %dead.operation_id,
            owner_id = %dead.owner_id,
            total_attempts = entry.total_attempts,
            %reason,
            "moved to dead letter"
        );
        Ok(())
    }

    /// Marks a dead-letter entry resolved; the entry itself is preserved.
    pub fn resolve_dead_letter(&self, id: &str, note: &str) -> SyncResult<()> {
        self.store.resolve_dead_letter(id, note, self.clock.now())?;
        info!(dead_letter_id = %id, "dead letter resolved");
        Ok(())
    }

    /// Lists dead letters still requiring attention for one tenant.
    pub fn unresolved_dead_letters(&self, owner_id: &str) -> SyncResult<Vec<DeadLetterEntry>> {
        Ok(self.store.unresolved_dead_letters(owner_id)?)
    }

    /// Returns the monitoring surface.
    pub fn health(&self) -> SyncResult<HealthReport> {
        let counts = self.store.queue_counts()?;
        Ok(HealthReport {
            healthy: counts.dead_letters == 0,
            pending_count: counts.pending,
            dead_letter_count: counts.dead_letters,
        })
    }

    fn audit(&self, item: &QueueItem, action: &str) -> SyncResult<()> {
        let snapshot = serde_json::to_value(item).unwrap_or(serde_json::Value::Null);
        let record = AuditRecord::new(
            item.user_id.clone(),
            item.collection.clone(),
            item.document_id.clone(),
            action,
            snapshot,
            self.clock.now(),
        );
        Ok(self.store.insert_audit(&record)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::remote::ScriptedRemote;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use ledgersync_queue::{OperationType, Payload};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn orchestrator() -> SyncOrchestrator<MemoryStore, ScriptedRemote, ManualClock> {
        SyncOrchestrator::new(
            MemoryStore::new(),
            ScriptedRemote::new(),
            ManualClock::new(t0()),
            EngineConfig::new(),
        )
    }

    fn item(document_id: &str) -> QueueItem {
        QueueItem::create(
            "user_1",
            "owner_1",
            OperationType::Create,
            "bills",
            document_id,
            Payload::new(),
            t0(),
        )
    }

    #[test]
    fn enqueue_is_durable_and_audited() {
        let orch = orchestrator();
        orch.enqueue(item("bill_1")).unwrap();

        assert_eq!(orch.health().unwrap().pending_count, 1);
        let audit = orch.store().audit_rows();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "ENQUEUED");
        assert_eq!(audit[0].target_table, "bills");
    }

    #[test]
    fn enqueue_surfaces_store_failure() {
        let orch = orchestrator();
        orch.store().set_fail_writes(true);

        let result = orch.enqueue(item("bill_1"));
        assert!(matches!(result, Err(SyncError::Store(_))));
    }

    #[tokio::test]
    async fn successful_dispatch_prunes_and_marks_document() {
        let orch = orchestrator();
        orch.enqueue(item("bill_1")).unwrap();

        let stats = orch.run_cycle().await.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.synced, 1);

        assert_eq!(orch.health().unwrap().pending_count, 0);
        assert_eq!(
            orch.store().synced_documents(),
            vec![("bills".to_string(), "bill_1".to_string())]
        );
        let actions: Vec<String> = orch
            .store()
            .audit_rows()
            .into_iter()
            .map(|row| row.action)
            .collect();
        assert_eq!(actions, vec!["ENQUEUED", "SYNCED"]);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let orch = orchestrator();
        orch.remote
            .push_outcome(CommitOutcome::Permanent("validation rejected".into()));
        orch.enqueue(item("bill_1")).unwrap();

        let stats = orch.run_cycle().await.unwrap();
        assert_eq!(stats.dead_lettered, 1);

        let dead = orch.unresolved_dead_letters("owner_1").unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].failure_reason, "validation rejected");
        assert_eq!(dead[0].total_attempts, 1);

        let health = orch.health().unwrap();
        assert!(!health.healthy);
        assert_eq!(health.pending_count, 0);
        assert_eq!(health.dead_letter_count, 1);
    }

    #[tokio::test]
    async fn transient_failure_backs_off() {
        let orch = orchestrator();
        orch.remote
            .push_outcome(CommitOutcome::Transient("timeout".into()));
        orch.enqueue(item("bill_1")).unwrap();

        let stats = orch.run_cycle().await.unwrap();
        assert_eq!(stats.retried, 1);

        // Still backing off: the next cycle dispatches nothing.
        let stats = orch.run_cycle().await.unwrap();
        assert_eq!(stats.dispatched, 0);
        assert_eq!(stats.skipped, 1);

        // After the backoff window it is dispatched and succeeds.
        orch.clock.advance(chrono::Duration::minutes(10));
        let stats = orch.run_cycle().await.unwrap();
        assert_eq!(stats.synced, 1);
    }

    #[tokio::test]
    async fn priority_orders_dispatch() {
        let orch = orchestrator();
        orch.enqueue(item("low").with_priority(10)).unwrap();
        orch.enqueue(item("high").with_priority(1)).unwrap();

        orch.run_cycle().await.unwrap();

        let received = orch.remote.received();
        assert_eq!(received[0].document_id, "high");
        assert_eq!(received[1].document_id, "low");
    }

    #[tokio::test]
    async fn same_document_dispatched_once_per_cycle_in_creation_order() {
        let orch = orchestrator();
        let first = item("bill_1");
        let mut second = item("bill_1");
        second.created_at = t0() + chrono::Duration::seconds(1);
        second.operation_id = format!("{}-b", second.operation_id);
        // Later record carries a better priority; creation order still wins.
        let second = second.with_priority(1);

        orch.enqueue(first).unwrap();
        orch.enqueue(second).unwrap();

        let stats = orch.run_cycle().await.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(orch.remote.received()[0].created_at, t0());

        let stats = orch.run_cycle().await.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(orch.remote.commit_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_run_stops() {
        let orch = orchestrator();
        orch.cancel();
        let result = orch.run().await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[test]
    fn resolve_missing_dead_letter_errors() {
        let orch = orchestrator();
        let result = orch.resolve_dead_letter("nope", "note");
        assert!(matches!(result, Err(SyncError::Store(_))));
    }
}
