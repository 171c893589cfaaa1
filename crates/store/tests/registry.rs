#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tidewatch_core::{BackoffPolicy, Error, Identity, PodObservation, PodPhase, RolloutTarget, Status};
use tidewatch_persist::{MemoryStore, StoreCall};
use tidewatch_store::{OpenParams, Registry, RegistryConfig};

fn config(linger_ms: u64) -> RegistryConfig {
    config_with_queue(linger_ms, 64)
}

fn config_with_queue(linger_ms: u64, write_queue: usize) -> RegistryConfig {
    RegistryConfig {
        linger: Duration::from_millis(linger_ms),
        write_queue,
        backoff: BackoffPolicy { base: Duration::from_millis(5), cap: Duration::from_millis(20), max_attempts: None },
    }
}

fn params() -> OpenParams {
    OpenParams { kind: "Deployment".into(), target: RolloutTarget::desired(1), deadline: Duration::from_secs(60), replace_sealed: false }
}

fn id(app: &str, generation: i64) -> Identity {
    Identity::new("test", "pe", app, generation)
}

fn running_pod(name: &str) -> PodObservation {
    PodObservation {
        name: name.into(),
        labels: Default::default(),
        phase: PodPhase::Running,
        ready: true,
        crash_looping: false,
        created_at: None,
        owner_replicaset: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_openers_join_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(store.clone(), config(1000));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let r = registry.clone();
        handles.push(tokio::spawn(async move { r.open(id("app", 1), params()).await.1 }));
    }
    let mut created = 0;
    for h in handles {
        if h.await.unwrap() {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.active(), vec![id("app", 1)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn apply_is_a_no_op_once_sealed() {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(store.clone(), config(1000));
    let (slot, _) = registry.open(id("app", 1), params()).await;

    let now = chrono::Utc::now();
    let applied = registry
        .apply(&slot, |n| {
            n.note_child_observation();
            n.application_mut("app").observe_pod(running_pod("p-1"), now)
        })
        .await;
    assert_eq!(applied, Some(true));

    assert!(registry.seal(&slot, Status::Succeeded, None).await);
    assert!(!registry.seal(&slot, Status::Failed, Some("late".into())).await);
    assert!(registry.apply(&slot, |n| n.application_mut("app").observe_pod(running_pod("p-2"), now)).await.is_none());

    let snap = registry.snapshot(slot.identity()).unwrap();
    assert_eq!(snap.status, Status::Succeeded);
    assert_eq!(snap.total_pods(), 1);
    assert!(snap.ended_at.is_some());
    assert!(registry.active().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn versions_increase_with_every_mutation() {
    let registry = Registry::new(Arc::new(MemoryStore::new()), config(1000));
    let (slot, _) = registry.open(id("app", 1), params()).await;
    let rx = registry.changes(&slot);
    let mut last = *rx.borrow();
    for i in 0..5 {
        let now = chrono::Utc::now();
        registry.apply(&slot, |n| n.application_mut("app").observe_pod(running_pod(&format!("p-{i}")), now)).await;
        let v = *rx.borrow();
        assert!(v > last);
        last = v;
    }
    assert_eq!(slot.current().total_pods(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_writes_upsert_before_completion() {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(store.clone(), config(1000));
    let (slot, _) = registry.open(id("app", 1), params()).await;
    for _ in 0..10 {
        registry.apply(&slot, |n| n.note_child_observation()).await;
    }
    registry.seal(&slot, Status::TimedOut, None).await;
    registry.flush().await;

    let calls = store.calls();
    let last_upsert = calls.iter().rposition(|c| matches!(c, StoreCall::Upsert { .. })).unwrap();
    let complete = calls.iter().position(|c| matches!(c, StoreCall::Complete { .. })).unwrap();
    assert!(last_upsert < complete);
    assert!(matches!(calls[last_upsert], StoreCall::Upsert { status: Status::TimedOut, .. }));
    assert_eq!(store.completed(slot.identity()).map(|c| c.0), Some(Status::TimedOut));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_storage_errors_are_retried() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next(3, Error::StorageTransient("database is locked".into()));
    let registry = Registry::new(store.clone(), config(1000));
    let (slot, _) = registry.open(id("app", 1), params()).await;
    registry.flush().await;
    assert!(store.narrative(slot.identity()).is_some());
    assert!(store.attempts() >= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permanent_storage_errors_still_seal_in_memory() {
    let store = Arc::new(MemoryStore::new());
    store.set_fault(Some(Error::StoragePermanent("disk full".into())));
    let registry = Registry::new(store.clone(), config(1000));
    let (slot, _) = registry.open(id("app", 1), params()).await;
    assert!(registry.seal(&slot, Status::Failed, Some("max-pod-failures".into())).await);
    registry.flush().await;
    assert_eq!(store.write_count(), 0);
    let snap = registry.snapshot(slot.identity()).unwrap();
    assert_eq!(snap.status, Status::Failed);
    assert_eq!(snap.status_reason.as_deref(), Some("max-pod-failures"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sealed_narratives_are_evicted_after_linger() {
    let registry = Registry::new(Arc::new(MemoryStore::new()), config(50));
    let (slot, _) = registry.open(id("app", 1), params()).await;
    let (other, _) = registry.open(id("other", 1), params()).await;
    registry.seal(&slot, Status::Cancelled, Some("deleted".into())).await;
    assert!(registry.snapshot(slot.identity()).is_some());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(registry.snapshot(slot.identity()).is_none());
    assert!(registry.snapshot(other.identity()).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_stops_all_writes() {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(store.clone(), config(1000));
    let (slot, _) = registry.open(id("app", 1), params()).await;
    registry.apply(&slot, |n| n.note_child_observation()).await;
    registry.close().await;
    let before = store.write_count();
    assert!(before >= 1);
    registry.apply(&slot, |n| n.note_child_observation()).await;
    registry.seal(&slot, Status::Cancelled, None).await;
    registry.flush().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.write_count(), before);
    registry.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_flight_lists_other_generations() {
    let registry = Registry::new(Arc::new(MemoryStore::new()), config(1000));
    registry.open(id("app", 1), params()).await;
    let (g2, _) = registry.open(id("app", 2), params()).await;
    registry.open(id("other", 1), params()).await;
    let mut gens: Vec<i64> = registry.in_flight_for(&id("app", 3)).iter().map(|s| s.identity().generation).collect();
    gens.sort();
    assert_eq!(gens, vec![1, 2]);
    registry.seal(&g2, Status::Cancelled, Some("superseded".into())).await;
    assert_eq!(registry.in_flight_for(&id("app", 3)).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn storage_outage_never_blocks_mutations() {
    let store = Arc::new(MemoryStore::new());
    store.set_fault(Some(Error::StorageTransient("database is locked".into())));
    let registry = Registry::new(store.clone(), config_with_queue(1000, 4));
    let (busy, _) = registry.open(id("busy", 1), params()).await;
    let (quiet, _) = registry.open(id("quiet", 1), params()).await;
    let (third, _) = registry.open(id("third", 1), params()).await;

    // Far more mutations than the writer takes per pass, all while storage is down.
    let applied = tokio::time::timeout(Duration::from_secs(2), async {
        for i in 0..50 {
            let now = chrono::Utc::now();
            registry.apply(&busy, |n| n.application_mut("busy").observe_pod(running_pod(&format!("p-{i}")), now)).await;
        }
    })
    .await;
    assert!(applied.is_ok(), "mutations waited on storage");
    let quick = tokio::time::timeout(Duration::from_millis(100), registry.apply(&quiet, |n| n.note_child_observation())).await;
    assert_eq!(quick.ok().flatten(), Some(()));
    let sealed = tokio::time::timeout(Duration::from_millis(100), registry.seal(&third, Status::Cancelled, None)).await;
    assert_eq!(sealed.ok(), Some(true));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.attempts() > 0);
    assert_eq!(store.write_count(), 0);

    store.set_fault(None);
    tokio::time::timeout(Duration::from_secs(2), registry.flush()).await.expect("writes drain once storage is back");
    assert_eq!(store.narrative(busy.identity()).map(|n| n.total_pods()), Some(50));
    assert_eq!(store.narrative(quiet.identity()).map(|n| n.status), Some(Status::Running));
    assert_eq!(store.completed(third.identity()).map(|c| c.0), Some(Status::Cancelled));
    // Coalesced: one upsert per identity is enough to carry the latest state.
    let busy_upserts = store.calls().iter().filter(|c| c.identity() == busy.identity()).count();
    assert!(busy_upserts < 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reopening_a_sealed_identity_resets_it() {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(store.clone(), config(1000));
    let (old, _) = registry.open(id("app", 1), params()).await;
    registry.seal(&old, Status::Cancelled, Some("deleted".into())).await;
    registry.flush().await;
    assert_eq!(store.completed(old.identity()).map(|c| c.0), Some(Status::Cancelled));

    // Joining is still the default for a plain open.
    let (joined, created) = registry.open(id("app", 1), params()).await;
    assert!(!created);
    assert!(joined.is_sealed());

    let (fresh, created) = registry.open(id("app", 1), OpenParams { replace_sealed: true, ..params() }).await;
    assert!(created);
    assert!(!fresh.is_sealed());
    assert_eq!(registry.active(), vec![id("app", 1)]);
    registry.apply(&fresh, |n| n.note_child_observation()).await;
    registry.seal(&fresh, Status::Succeeded, None).await;
    registry.flush().await;

    assert!(store.calls().iter().any(|c| matches!(c, StoreCall::Reset { .. })));
    assert_eq!(store.completed(fresh.identity()).map(|c| c.0), Some(Status::Succeeded));
    assert_eq!(store.narrative(fresh.identity()).map(|n| n.status), Some(Status::Succeeded));
    // The old slot's eviction timer must not remove the new narrative.
    assert_eq!(registry.snapshot(fresh.identity()).map(|n| n.status), Some(Status::Succeeded));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reopening_after_eviction_still_resets_storage() {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(store.clone(), config(20));
    let (old, _) = registry.open(id("app", 1), params()).await;
    registry.seal(&old, Status::Cancelled, Some("deleted".into())).await;
    registry.flush().await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(registry.snapshot(old.identity()).is_none());

    let (fresh, created) = registry.open(id("app", 1), OpenParams { replace_sealed: true, ..params() }).await;
    assert!(created);
    registry.flush().await;
    assert!(store.completed(fresh.identity()).is_none());
    assert_eq!(store.narrative(fresh.identity()).map(|n| n.status), Some(Status::Pending));
}
