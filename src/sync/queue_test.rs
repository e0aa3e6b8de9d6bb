//! Tests for the pending change queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use super::clock::MockClock;
use super::error::SyncError;
use super::queue::{Keep, PendingChangeQueue};
use crate::db::{ChangeStatus, ChangeTarget, Database, DbError, SqliteDatabase};

/// Clock that advances one second per call.
fn ticking_clock() -> Arc<MockClock> {
    let base = Utc.with_ymd_and_hms(2026, 4, 1, 6, 30, 0).unwrap();
    let tick = AtomicI64::new(0);
    let mut clock = MockClock::new();
    clock
        .expect_now()
        .returning(move || base + Duration::seconds(tick.fetch_add(1, Ordering::SeqCst)));
    Arc::new(clock)
}

async fn setup_queue() -> PendingChangeQueue<SqliteDatabase> {
    let db = SqliteDatabase::in_memory().await.unwrap();
    db.migrate().await.unwrap();
    PendingChangeQueue::with_clock(Arc::new(db), ticking_clock())
}

#[tokio::test(flavor = "multi_thread")]
async fn coalescing_keeps_only_latest_change_per_target() {
    let queue = setup_queue().await;

    let a = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"stock": 1}))
        .await
        .unwrap();
    let b = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"stock": 2}))
        .await
        .unwrap();
    let c = queue
        .enqueue(ChangeTarget::update("/api/machines/2"), json!({"hours": 1200}))
        .await
        .unwrap();

    let all = queue.all().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].payload, json!({"stock": 2}));
    assert_eq!(all[0].target, ChangeTarget::update("/api/parts/1"));
    assert_eq!(all[1].id, c.id);

    // The surviving entry keeps the first id but the latest timestamp.
    assert_eq!(b.id, a.id);
    assert!(b.enqueued_at > a.enqueued_at);
}

#[tokio::test(flavor = "multi_thread")]
async fn creates_on_same_collection_are_kept_apart() {
    let queue = setup_queue().await;

    let first = queue
        .enqueue(ChangeTarget::create("/api/parts"), json!({"serial": "A-1"}))
        .await
        .unwrap();
    let second = queue
        .enqueue(ChangeTarget::create("/api/parts"), json!({"serial": "B-2"}))
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    let payloads: Vec<_> = queue
        .all()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.payload)
        .collect();
    assert_eq!(payloads, vec![json!({"serial": "A-1"}), json!({"serial": "B-2"})]);
}

#[tokio::test(flavor = "multi_thread")]
async fn coalescing_moves_entry_behind_newer_targets() {
    let queue = setup_queue().await;

    queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 1}))
        .await
        .unwrap();
    queue
        .enqueue(ChangeTarget::update("/api/sites/4"), json!({"v": 1}))
        .await
        .unwrap();
    queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 2}))
        .await
        .unwrap();

    let resources: Vec<String> = queue
        .all()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.target.resource)
        .collect();
    assert_eq!(resources, vec!["/api/sites/4", "/api/parts/1"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn different_methods_on_same_resource_do_not_coalesce() {
    let queue = setup_queue().await;

    queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 1}))
        .await
        .unwrap();
    queue
        .enqueue(ChangeTarget::delete("/api/parts/1"), json!(null))
        .await
        .unwrap();

    assert_eq!(queue.all().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn in_flight_change_is_not_coalesced_into() {
    let queue = setup_queue().await;
    let first = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 1}))
        .await
        .unwrap();
    queue.mark_in_flight(&first.id).await.unwrap();

    let second = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 2}))
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(queue.get(&first.id).await.unwrap().payload, json!({"v": 1}));
}

#[tokio::test(flavor = "multi_thread")]
async fn only_one_in_flight_change_per_target() {
    let queue = setup_queue().await;
    let first = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 1}))
        .await
        .unwrap();
    queue.mark_in_flight(&first.id).await.unwrap();
    let second = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 2}))
        .await
        .unwrap();

    let err = queue.mark_in_flight(&second.id).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Storage(DbError::InvalidState { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn peek_batch_returns_pending_in_fifo_order() {
    let queue = setup_queue().await;
    let mut ids = Vec::new();
    for i in 0..4 {
        let c = queue
            .enqueue(ChangeTarget::create(format!("/api/parts/{}", i)), json!({"i": i}))
            .await
            .unwrap();
        ids.push(c.id);
    }
    queue.mark_failed(&ids[1], "422").await.unwrap();

    let batch: Vec<String> = queue
        .peek_batch(2)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(batch, vec![ids[0].clone(), ids[2].clone()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn mark_applied_removes_and_replay_is_noop() {
    let queue = setup_queue().await;
    let c = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 1}))
        .await
        .unwrap();

    assert!(queue.mark_applied(&c.id).await.unwrap());
    assert!(!queue.mark_applied(&c.id).await.unwrap());
    assert!(queue.all().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_count_attempts_and_keep_change_pending() {
    let queue = setup_queue().await;
    let c = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 1}))
        .await
        .unwrap();
    queue.mark_in_flight(&c.id).await.unwrap();

    let after = queue
        .record_transient_failure(&c.id, "503 Service Unavailable")
        .await
        .unwrap();
    assert_eq!(after.attempts, 1);
    assert_eq!(after.status, ChangeStatus::Pending);
    assert_eq!(after.last_error.as_deref(), Some("503 Service Unavailable"));
    assert_eq!(after.id, c.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_change_stays_visible_until_retried() {
    let queue = setup_queue().await;
    let c = queue
        .enqueue(ChangeTarget::create("/api/parts"), json!({"serial": ""}))
        .await
        .unwrap();
    queue.mark_failed(&c.id, "422 serial required").await.unwrap();

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.outstanding(), 0);
    assert!(queue.peek_batch(10).await.unwrap().is_empty());

    let retried = queue.retry(&c.id).await.unwrap();
    assert_eq!(retried.status, ChangeStatus::Pending);
    assert_eq!(retried.attempts, 0);
    assert_eq!(queue.peek_batch(10).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_rejects_pending_change() {
    let queue = setup_queue().await;
    let c = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({}))
        .await
        .unwrap();

    assert!(queue.retry(&c.id).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_keep_local_requeues_as_forced() {
    let queue = setup_queue().await;
    let c = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 1}))
        .await
        .unwrap();
    queue.hold(&c.id, "modified on the server").await.unwrap();
    assert_eq!(queue.counts().await.unwrap().needs_attention, 1);

    let requeued = queue.resolve(&c.id, Keep::Local).await.unwrap().unwrap();
    assert!(requeued.force);
    assert_eq!(requeued.status, ChangeStatus::Pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn new_edit_after_forced_resolve_is_not_forced() {
    let queue = setup_queue().await;
    let c = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"stock": 1}))
        .await
        .unwrap();
    queue.hold(&c.id, "modified on the server").await.unwrap();
    queue.resolve(&c.id, Keep::Local).await.unwrap();

    let edited = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"stock": 2}))
        .await
        .unwrap();

    assert_eq!(edited.id, c.id);
    assert!(!edited.force);
    assert!(!queue.get(&c.id).await.unwrap().force);
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_keep_server_drops_change() {
    let queue = setup_queue().await;
    let c = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 1}))
        .await
        .unwrap();
    queue.hold(&c.id, "modified on the server").await.unwrap();

    assert!(queue.resolve(&c.id, Keep::Server).await.unwrap().is_none());
    assert!(queue.all().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_requires_held_change() {
    let queue = setup_queue().await;
    let c = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 1}))
        .await
        .unwrap();

    assert!(queue.resolve(&c.id, Keep::Local).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn resubmit_sets_force_and_payload() {
    let queue = setup_queue().await;
    let c = queue
        .enqueue(ChangeTarget::update("/api/parts/1"), json!({"v": 1}))
        .await
        .unwrap();

    let forced = queue
        .resubmit(&c.id, c.target.clone(), json!({"v": 1, "name": "Pump"}))
        .await
        .unwrap();
    assert!(forced.force);
    assert_eq!(forced.payload, json!({"v": 1, "name": "Pump"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_survives_restart_and_recovers_in_flight() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");

    let id = {
        let db = SqliteDatabase::open(&path).await.unwrap();
        db.migrate().await.unwrap();
        let queue = PendingChangeQueue::with_clock(Arc::new(db), ticking_clock());
        let c = queue
            .enqueue(ChangeTarget::update("/api/machines/9"), json!({"hours": 10}))
            .await
            .unwrap();
        queue.mark_in_flight(&c.id).await.unwrap();
        c.id
    };

    let db = SqliteDatabase::open(&path).await.unwrap();
    db.migrate().await.unwrap();
    let queue = PendingChangeQueue::with_clock(Arc::new(db), ticking_clock());

    assert_eq!(queue.get(&id).await.unwrap().status, ChangeStatus::InFlight);
    assert_eq!(queue.recover().await.unwrap(), 1);
    let batch = queue.peek_batch(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, id);
}

#[test]
fn keep_parses_sides() {
    assert_eq!("local".parse::<Keep>().unwrap(), Keep::Local);
    assert_eq!("server".parse::<Keep>().unwrap(), Keep::Server);
    assert!("both".parse::<Keep>().is_err());
}
