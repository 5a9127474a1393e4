//! End-to-end orchestrator scenarios against the in-memory fakes.

use chrono::{DateTime, Duration, TimeZone, Utc};
use ledgersync_engine::{
    ClientWins, Clock, CommitOutcome, EngineConfig, LocalStore, ManualClock, ManualResolution,
    MemoryStore, ScriptedRemote, SyncOrchestrator,
};
use ledgersync_queue::{MultiStepOp, OperationType, Payload, QueueItem, SyncStatus};
use serde_json::json;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn bill_item(document_id: &str) -> QueueItem {
    QueueItem::create(
        "staff_7",
        "owner_1",
        OperationType::Create,
        "bills",
        document_id,
        payload(json!({"invoice_number": "INV-1", "total_amount": 99.5})),
        t0(),
    )
}

fn orchestrator(
    store: MemoryStore,
) -> SyncOrchestrator<MemoryStore, ScriptedRemote, ManualClock> {
    SyncOrchestrator::new(
        store,
        ScriptedRemote::new(),
        ManualClock::new(t0()),
        EngineConfig::new(),
    )
}

/// Three transient failures leave the record in Retry with
/// strictly increasing retry deadlines; the fourth and fifth push it over
/// the budget into the dead-letter store with the full attempt count.
#[tokio::test]
async fn transient_failures_escalate_after_budget() {
    let orch = orchestrator(MemoryStore::new());
    let orch_clock_step = Duration::minutes(10);

    orch.remote()
        .push_outcomes(CommitOutcome::Transient("server busy".into()), 5);

    let original = bill_item("doc_1");
    let operation_id = original.operation_id.clone();
    orch.enqueue(original).unwrap();

    let mut deadlines = Vec::new();
    for expected_retries in 1..=4u32 {
        let stats = orch.run_cycle().await.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.retried, 1);

        let stored = orch.store().get_item(&operation_id).unwrap();
        assert_eq!(stored.status, SyncStatus::Retry);
        assert_eq!(stored.retry_count, expected_retries);
        assert_eq!(stored.last_error.as_deref(), Some("server busy"));
        deadlines.push(orch.config().backoff.next_retry_time(&stored));

        orch.clock().advance(orch_clock_step);
    }

    // Deadlines computed against a fixed anchor grow with the retry count;
    // here each anchor also advances, so they are strictly increasing.
    for pair in deadlines.windows(2) {
        assert!(pair[0] < pair[1]);
    }

    // Fifth transient failure exhausts the budget.
    let stats = orch.run_cycle().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert!(orch.store().get_item(&operation_id).is_none());

    let dead = orch.unresolved_dead_letters("owner_1").unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_operation_id, operation_id);
    assert_eq!(dead[0].total_attempts, 5);
    assert!(dead[0].failure_reason.contains("retry budget exhausted"));

    let health = orch.health().unwrap();
    assert!(!health.healthy);
    assert_eq!(health.dead_letter_count, 1);
}

/// Crash before dispatch loses nothing: the record is still pending in the
/// store a fresh orchestrator is built over, and its idempotent id is
/// unchanged, so the remote sees the same logical delivery.
#[tokio::test]
async fn pending_record_survives_restart() {
    let store = MemoryStore::new();
    let original = bill_item("doc_1");
    let operation_id = original.operation_id.clone();

    {
        let orch = orchestrator(store);
        orch.enqueue(original).unwrap();
        // Process dies here; no cycle ran.
        let restarted = orchestrator(orch.into_store());

        let stored = restarted.store().get_item(&operation_id).unwrap();
        assert_eq!(stored.status, SyncStatus::Pending);

        restarted.recover_stale().unwrap();
        let stats = restarted.drain().await.unwrap();
        assert_eq!(stats.synced, 1);
        assert_eq!(restarted.remote().received()[0].operation_id, operation_id);
    }
}

/// A record caught InProgress by a crash is re-evaluated as Retry on
/// restart once it exceeds the staleness threshold.
#[tokio::test]
async fn stale_in_progress_is_recovered() {
    let store = MemoryStore::new();
    let mut item = bill_item("doc_1");
    item = item.begin_attempt(t0()).unwrap();
    let operation_id = item.operation_id.clone();
    store.insert_item(&item).unwrap();

    let orch = SyncOrchestrator::new(
        store,
        ScriptedRemote::new(),
        ManualClock::new(t0() + Duration::minutes(30)),
        EngineConfig::new(),
    );

    let recovered = orch.recover_stale().unwrap();
    assert_eq!(recovered, 1);

    let stored = orch.store().get_item(&operation_id).unwrap();
    assert_eq!(stored.status, SyncStatus::Retry);
    assert_eq!(stored.retry_count, 1);

    // A fresh attempt that is not yet stale is left alone.
    let fresh = bill_item("doc_2").begin_attempt(orch.clock().now()).unwrap();
    orch.store().insert_item(&fresh).unwrap();
    assert_eq!(orch.recover_stale().unwrap(), 0);
}

/// Multi-step groups drain in step order and resume mid-group: if step 1
/// fails transiently, step 2 is not attempted until step 1 has synced.
#[tokio::test]
async fn group_steps_sync_in_causal_order() {
    let orch = orchestrator(MemoryStore::new());

    let group = MultiStepOp::new("staff_7", "owner_1", "customer with opening bill", t0())
        .add_step(
            "create customer",
            OperationType::Create,
            "customers",
            "cust_1",
            payload(json!({"name": "Asha"})),
        )
        .add_step(
            "create bill",
            OperationType::Create,
            "bills",
            "bill_1",
            payload(json!({"customer_id": "cust_1"})),
        );

    orch.remote()
        .push_outcome(CommitOutcome::Transient("timeout".into()));
    let ids = orch.enqueue_group(&group, 10).unwrap();
    assert_eq!(ids.len(), 2);

    // Step 1 fails; step 2 must not have been attempted.
    let stats = orch.run_cycle().await.unwrap();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(orch.remote().received()[0].document_id, "cust_1");

    // Step 2 stays gated while step 1 backs off.
    let stats = orch.run_cycle().await.unwrap();
    assert_eq!(stats.dispatched, 0);

    orch.clock().advance(Duration::minutes(10));
    orch.drain().await.unwrap();

    let received = orch.remote().received();
    assert_eq!(received.len(), 3);
    assert_eq!(received[1].document_id, "cust_1");
    assert_eq!(received[2].document_id, "bill_1");
    assert_eq!(received[2].step_number, 2);
    assert_eq!(orch.health().unwrap().pending_count, 0);
}

/// Default policy: on conflict the server version stands. The item reaches
/// Synced without a second commit and the conflict is visible in stats.
#[tokio::test]
async fn conflict_server_wins_discards_local_write() {
    let orch = orchestrator(MemoryStore::new());
    orch.remote().push_outcome(CommitOutcome::Conflict(payload(
        json!({"invoice_number": "INV-1", "total_amount": 120.0}),
    )));

    orch.enqueue(bill_item("doc_1")).unwrap();
    let stats = orch.run_cycle().await.unwrap();

    assert_eq!(stats.conflicts, 1);
    assert_eq!(stats.synced, 1);
    assert_eq!(orch.remote().commit_count(), 1);
    assert_eq!(orch.health().unwrap().pending_count, 0);
    assert!(orch.health().unwrap().healthy);

    let actions: Vec<String> = orch
        .store()
        .audit_rows()
        .into_iter()
        .map(|row| row.action)
        .collect();
    assert_eq!(actions, vec!["ENQUEUED", "CONFLICT_DISCARDED"]);
}

/// Client-wins routes the conflicted item through the retry path; the
/// second attempt lands.
#[tokio::test]
async fn conflict_client_wins_retries_local_write() {
    let orch = orchestrator(MemoryStore::new()).with_conflict_policy(ClientWins);
    orch.remote()
        .push_outcome(CommitOutcome::Conflict(Payload::new()));

    orch.enqueue(bill_item("doc_1")).unwrap();
    let stats = orch.run_cycle().await.unwrap();
    assert_eq!(stats.conflicts, 1);
    assert_eq!(stats.retried, 1);

    orch.clock().advance(Duration::minutes(10));
    let stats = orch.run_cycle().await.unwrap();
    assert_eq!(stats.synced, 1);
    assert_eq!(orch.remote().commit_count(), 2);
}

/// Manual policy parks conflicts for an operator, and resolution keeps the
/// entry for audit.
#[tokio::test]
async fn conflict_manual_policy_escalates_and_resolves() {
    let orch = orchestrator(MemoryStore::new()).with_conflict_policy(ManualResolution);
    orch.remote()
        .push_outcome(CommitOutcome::Conflict(Payload::new()));

    orch.enqueue(bill_item("doc_1")).unwrap();
    orch.run_cycle().await.unwrap();

    let dead = orch.unresolved_dead_letters("owner_1").unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].failure_reason.contains("unresolved conflict"));
    // The single dispatched commit counts as an attempt in the history.
    assert_eq!(orch.remote().commit_count(), 1);
    assert_eq!(dead[0].total_attempts, 1);

    orch.resolve_dead_letter(&dead[0].id, "applied merged totals by hand")
        .unwrap();
    assert!(orch.unresolved_dead_letters("owner_1").unwrap().is_empty());
    assert!(orch.health().unwrap().healthy);
    assert_eq!(orch.store().all_dead_letters().len(), 1);
}

/// Dead letters are tenant-scoped: one owner's backlog is invisible to
/// another's listing.
#[tokio::test]
async fn dead_letters_are_tenant_scoped() {
    let orch = orchestrator(MemoryStore::new());
    orch.remote()
        .push_outcomes(CommitOutcome::Permanent("auth denied".into()), 2);

    let mut other_tenant = bill_item("doc_2");
    other_tenant.owner_id = "owner_2".into();
    other_tenant.user_id = "staff_9".into();

    orch.enqueue(bill_item("doc_1")).unwrap();
    orch.enqueue(other_tenant).unwrap();
    orch.drain().await.unwrap();

    let owner_1 = orch.unresolved_dead_letters("owner_1").unwrap();
    let owner_2 = orch.unresolved_dead_letters("owner_2").unwrap();
    assert_eq!(owner_1.len(), 1);
    assert_eq!(owner_2.len(), 1);
    assert_eq!(owner_1[0].owner_id, "owner_1");
    assert_eq!(owner_2[0].owner_id, "owner_2");
}
