mod common;

use chrono::Utc;
use common::*;
use futures::TryStreamExt;
use roster_sync::db;
use roster_sync::model::{OutboxOperation, SyncState, VoterRecord};
use serde_json::json;

#[tokio::test]
async fn put_get_and_count_are_scoped_per_database() {
    let pool = db::open_in_memory().await.unwrap();
    let mut rec = VoterRecord::empty("1", Utc::now());
    rec.name = "Asha".into();
    rec.sync_state = SyncState::Confirmed;
    rec.refresh_search_keys();

    db::put_voter(&pool, DB, &rec).await.unwrap();
    db::put_voter(&pool, "other", &rec).await.unwrap();

    assert_eq!(db::count_voters(&pool, DB).await.unwrap(), 1);
    assert_eq!(db::count_voters(&pool, "other").await.unwrap(), 1);
    let fetched = db::get_voter(&pool, DB, "1").await.unwrap().unwrap();
    assert_eq!(fetched.name_lower, "asha");
    assert!(db::get_voter(&pool, DB, "2").await.unwrap().is_none());

    assert_eq!(db::clear_voters(&pool, DB).await.unwrap(), 1);
    assert_eq!(db::count_voters(&pool, DB).await.unwrap(), 0);
    assert_eq!(db::count_voters(&pool, "other").await.unwrap(), 1);
}

#[tokio::test]
async fn scan_is_restartable() {
    let pool = db::open_in_memory().await.unwrap();
    let records: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|id| VoterRecord::empty(*id, Utc::now()))
        .collect();
    assert_eq!(db::bulk_put_voters(&pool, DB, &records).await.unwrap(), 3);

    let first: Vec<VoterRecord> = db::scan_voters(&pool, DB).try_collect().await.unwrap();
    let second: Vec<VoterRecord> = db::scan_voters(&pool, DB).try_collect().await.unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
}

#[tokio::test]
async fn local_edit_writes_record_and_outbox_together() {
    let pool = db::open_in_memory().await.unwrap();

    let created = db::apply_local_edit(&pool, DB, " 7 ", &row(json!({"name": "Asha  Patil"})))
        .await
        .unwrap();
    assert_eq!(created.id, "7");
    assert_eq!(created.name_lower, "asha patil");
    assert_eq!(created.sync_state, SyncState::LocalOnly);

    let updated = db::apply_local_edit(&pool, DB, "7", &row(json!({"mobile": "98220"})))
        .await
        .unwrap();
    assert_eq!(updated.name, "Asha  Patil");
    assert_eq!(updated.mobile, "98220");

    let outbox = db::list_outbox(&pool, DB).await.unwrap();
    assert_eq!(outbox.len(), 2);
    assert!(outbox[0].seq < outbox[1].seq);
    assert!(outbox.iter().all(|e| e.record_id == "7" && e.operation == OutboxOperation::Upsert));
    assert_eq!(outbox[1].payload["mobile"], "98220");
    assert_eq!(db::count_local_only(&pool, DB).await.unwrap(), 1);
}

#[tokio::test]
async fn local_edit_rejects_blank_ids() {
    let pool = db::open_in_memory().await.unwrap();
    assert!(db::apply_local_edit(&pool, DB, "  ", &row(json!({"name": "x"})))
        .await
        .is_err());
    assert_eq!(db::count_outbox(&pool, DB).await.unwrap(), 0);
}

#[tokio::test]
async fn acknowledging_part_of_a_records_queue_keeps_it_local_only() {
    let pool = db::open_in_memory().await.unwrap();
    db::apply_local_edit(&pool, DB, "7", &row(json!({"mobile": "1"}))).await.unwrap();
    db::apply_local_edit(&pool, DB, "7", &row(json!({"mobile": "2"}))).await.unwrap();
    let outbox = db::list_outbox(&pool, DB).await.unwrap();

    assert_eq!(db::delete_outbox_many(&pool, DB, &[outbox[0].seq]).await.unwrap(), 1);
    let rec = db::get_voter(&pool, DB, "7").await.unwrap().unwrap();
    assert_eq!(rec.sync_state, SyncState::LocalOnly);

    assert_eq!(db::delete_outbox_many(&pool, DB, &[outbox[1].seq]).await.unwrap(), 1);
    let rec = db::get_voter(&pool, DB, "7").await.unwrap().unwrap();
    assert_eq!(rec.sync_state, SyncState::Confirmed);
    assert_eq!(db::delete_outbox_many(&pool, DB, &[outbox[1].seq]).await.unwrap(), 0);
}

#[tokio::test]
async fn enqueue_outbox_directly() {
    let pool = db::open_in_memory().await.unwrap();
    let at = Utc::now();
    let seq = db::enqueue_outbox(&pool, DB, "x", OutboxOperation::Upsert, &row(json!({"a": 1})), at)
        .await
        .unwrap();
    let entries = db::list_outbox(&pool, DB).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].seq, seq);
    assert_eq!(entries[0].database_id, DB);
    assert!(db::list_outbox(&pool, "other").await.unwrap().is_empty());
}

#[tokio::test]
async fn meta_round_trip() {
    let pool = db::open_in_memory().await.unwrap();
    assert!(db::meta_get(&pool, "k").await.unwrap().is_none());
    db::meta_put(&pool, "k", "v1").await.unwrap();
    db::meta_put(&pool, "k", "v2").await.unwrap();
    assert_eq!(db::meta_get(&pool, "k").await.unwrap().as_deref(), Some("v2"));
    db::meta_delete(&pool, "k").await.unwrap();
    assert!(db::meta_get(&pool, "k").await.unwrap().is_none());
}
