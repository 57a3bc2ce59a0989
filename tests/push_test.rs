mod common;

use common::*;
use roster_sync::db;
use roster_sync::gateway::{PushOutcome, RejectedChange};
use roster_sync::model::SyncState;
use roster_sync::sync::SyncError;
use serde_json::json;

async fn edit(pool: &db::Pool, id: &str, mobile: &str) {
    db::apply_local_edit(pool, DB, id, &row(json!({"mobile": mobile})))
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_outbox_is_a_no_op() {
    let gateway = RecordingGateway::default();
    let (_pool, engine) = engine(&gateway).await;

    let report = engine.push().await.unwrap();
    assert_eq!((report.pushed, report.failed), (0, 0));
    assert!(gateway.push_calls().await.is_empty());
}

#[tokio::test]
async fn push_sends_queued_changes_in_order() {
    let gateway = RecordingGateway::default();
    let (pool, engine) = engine(&gateway).await;
    edit(&pool, "A", "1").await;
    edit(&pool, "B", "2").await;
    edit(&pool, "A", "3").await;

    let report = engine.push().await.unwrap();
    assert_eq!(report.pushed, 3);

    let calls = gateway.push_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].database_id, DB);
    let sent: Vec<_> = calls[0]
        .changes
        .iter()
        .map(|c| (c.id.as_str(), c.payload["mobile"].as_str().unwrap()))
        .collect();
    assert_eq!(sent, vec![("A", "1"), ("B", "2"), ("A", "3")]);

    assert_eq!(db::count_outbox(&pool, DB).await.unwrap(), 0);
    let a = db::get_voter(&pool, DB, "A").await.unwrap().unwrap();
    assert_eq!(a.mobile, "3");
    assert_eq!(a.sync_state, SyncState::Confirmed);
}

#[tokio::test]
async fn partial_acknowledgement_keeps_unacknowledged_entries() {
    let gateway = RecordingGateway::with_pushes(vec![Ok(PushOutcome {
        accepted_ids: vec!["A".into(), "C".into()],
        rejected: vec![RejectedChange {
            id: "B".into(),
            reason: Some("stale".into()),
        }],
    })]);
    let (pool, engine) = engine(&gateway).await;
    for id in ["A", "B", "C"] {
        edit(&pool, id, "5").await;
    }

    let report = engine.push().await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.rejected.len(), 1);

    let remaining = db::list_outbox(&pool, DB).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].record_id, "B");

    let state = |id: &'static str| {
        let pool = pool.clone();
        async move { db::get_voter(&pool, DB, id).await.unwrap().unwrap().sync_state }
    };
    assert_eq!(state("A").await, SyncState::Confirmed);
    assert_eq!(state("B").await, SyncState::LocalOnly);
    assert_eq!(state("C").await, SyncState::Confirmed);

    // The retry carries only what is still queued.
    engine.push().await.unwrap();
    let calls = gateway.push_calls().await;
    assert_eq!(calls[1].changes.len(), 1);
    assert_eq!(calls[1].changes[0].id, "B");
    assert_eq!(state("B").await, SyncState::Confirmed);
}

#[tokio::test]
async fn transport_failure_leaves_everything_queued() {
    let gateway = RecordingGateway::with_pushes(vec![Err(server_error())]);
    let (pool, engine) = engine(&gateway).await;
    edit(&pool, "A", "42").await;
    let before = db::list_outbox(&pool, DB).await.unwrap();

    let err = engine.push().await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));

    assert_eq!(db::list_outbox(&pool, DB).await.unwrap(), before);
    let a = db::get_voter(&pool, DB, "A").await.unwrap().unwrap();
    assert_eq!(a.mobile, "42");
    assert_eq!(a.sync_state, SyncState::LocalOnly);
}

#[tokio::test]
async fn acknowledgement_for_unknown_ids_removes_nothing() {
    let gateway = RecordingGateway::with_pushes(vec![Ok(PushOutcome {
        accepted_ids: vec!["Z".into()],
        rejected: vec![],
    })]);
    let (pool, engine) = engine(&gateway).await;
    edit(&pool, "A", "1").await;

    let report = engine.push().await.unwrap();
    assert_eq!((report.pushed, report.failed), (0, 1));
    assert_eq!(db::count_outbox(&pool, DB).await.unwrap(), 1);
}
