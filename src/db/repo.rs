use super::model::{OutboxRow, VoterRow};
use crate::model::{OutboxEntry, OutboxOperation, Patch, SyncState, VoterRecord};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

const UPSERT_VOTER: &str = "INSERT INTO voters (database_id, id, name, name_lower, voter_identifier, \
     voter_identifier_lower, mobile, booth_or_part, serial, attributes, raw_fields, sync_state, updated_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
     ON CONFLICT(database_id, id) DO UPDATE SET \
         name = excluded.name, name_lower = excluded.name_lower, \
         voter_identifier = excluded.voter_identifier, \
         voter_identifier_lower = excluded.voter_identifier_lower, \
         mobile = excluded.mobile, booth_or_part = excluded.booth_or_part, serial = excluded.serial, \
         attributes = excluded.attributes, raw_fields = excluded.raw_fields, \
         sync_state = excluded.sync_state, updated_at = excluded.updated_at";

const SELECT_VOTER: &str = "SELECT id, name, name_lower, voter_identifier, voter_identifier_lower, \
     mobile, booth_or_part, serial, attributes, raw_fields, sync_state, updated_at \
     FROM voters WHERE database_id = ? AND id = ?";

// Upserts keep the rowid, so rowid order is first-insertion order.
const SCAN_VOTERS: &str = "SELECT id, name, name_lower, voter_identifier, voter_identifier_lower, \
     mobile, booth_or_part, serial, attributes, raw_fields, sync_state, updated_at \
     FROM voters WHERE database_id = ? ORDER BY rowid";

const SELECT_OUTBOX: &str = "SELECT seq, database_id, record_id, operation, payload, updated_at \
     FROM outbox WHERE database_id = ? ORDER BY seq";

const SELECT_OUTBOX_FOR_RECORD: &str = "SELECT seq, database_id, record_id, operation, payload, updated_at \
     FROM outbox WHERE database_id = ? AND record_id = ? ORDER BY seq";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let url = resolve_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("invalid database url {url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Single-connection in-memory store with migrations applied. Every pool
/// connection to `:memory:` is a separate database, hence the cap of one.
pub async fn open_in_memory() -> Result<Pool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and create the parent
/// directory. In-memory and non-sqlite URLs pass through unchanged.
fn resolve_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), ?err, "failed to create database directory");
            }
        }
    }

    match query {
        Some(query) => format!("sqlite://{path}?{query}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

async fn upsert_voter(
    conn: &mut SqliteConnection,
    database_id: &str,
    record: &VoterRecord,
) -> Result<()> {
    let attributes = serde_json::to_string(&record.attributes)?;
    let raw_fields = serde_json::to_string(&record.raw_fields)?;
    sqlx::query(UPSERT_VOTER)
        .bind(database_id)
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.name_lower)
        .bind(&record.voter_identifier)
        .bind(&record.voter_identifier_lower)
        .bind(&record.mobile)
        .bind(&record.booth_or_part)
        .bind(&record.serial)
        .bind(attributes)
        .bind(raw_fields)
        .bind(record.sync_state.as_str())
        .bind(record.updated_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn fetch_voter(
    conn: &mut SqliteConnection,
    database_id: &str,
    id: &str,
) -> Result<Option<VoterRecord>> {
    let row = sqlx::query_as::<_, VoterRow>(SELECT_VOTER)
        .bind(database_id)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(VoterRecord::try_from).transpose()
}

/// Insert or replace one voter; last write wins.
#[instrument(skip_all)]
pub async fn put_voter(pool: &Pool, database_id: &str, record: &VoterRecord) -> Result<()> {
    let mut conn = pool.acquire().await?;
    upsert_voter(&mut conn, database_id, record).await
}

/// Insert or replace many voters atomically.
#[instrument(skip_all, fields(count = records.len()))]
pub async fn bulk_put_voters(
    pool: &Pool,
    database_id: &str,
    records: &[VoterRecord],
) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for record in records {
        upsert_voter(&mut tx, database_id, record).await?;
    }
    tx.commit().await?;
    Ok(records.len())
}

/// Store pulled voters in one transaction. Records with queued outbox
/// entries get those patches re-applied on top and stay `LocalOnly`, so
/// the local view keeps reflecting every unacknowledged edit.
#[instrument(skip_all, fields(count = records.len()))]
pub async fn merge_pulled_voters(
    pool: &Pool,
    database_id: &str,
    records: Vec<VoterRecord>,
) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let pending: HashSet<String> =
        sqlx::query_scalar::<_, String>("SELECT DISTINCT record_id FROM outbox WHERE database_id = ?")
            .bind(database_id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();

    let count = records.len();
    for mut record in records {
        if pending.contains(&record.id) {
            let rows = sqlx::query_as::<_, OutboxRow>(SELECT_OUTBOX_FOR_RECORD)
                .bind(database_id)
                .bind(&record.id)
                .fetch_all(&mut *tx)
                .await?;
            for row in rows {
                let entry = OutboxEntry::try_from(row)?;
                record.apply_patch(&entry.payload, entry.updated_at);
            }
            record.sync_state = SyncState::LocalOnly;
        } else {
            record.sync_state = SyncState::Confirmed;
        }
        // An unchanged row keeps its stored timestamp so re-pulls are no-ops.
        if let Some(stored) = fetch_voter(&mut tx, database_id, &record.id).await? {
            if stored.same_content(&record) {
                record.updated_at = stored.updated_at;
            }
        }
        upsert_voter(&mut tx, database_id, &record).await?;
    }
    tx.commit().await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn get_voter(pool: &Pool, database_id: &str, id: &str) -> Result<Option<VoterRecord>> {
    let mut conn = pool.acquire().await?;
    fetch_voter(&mut conn, database_id, id).await
}

/// Lazily stream every voter of a database in insertion order. Call again
/// to restart from the beginning.
pub fn scan_voters<'a>(
    pool: &'a Pool,
    database_id: &'a str,
) -> BoxStream<'a, Result<VoterRecord>> {
    sqlx::query_as::<_, VoterRow>(SCAN_VOTERS)
        .bind(database_id)
        .fetch(pool)
        .map(|row| {
            row.map_err(anyhow::Error::from)
                .and_then(VoterRecord::try_from)
        })
        .boxed()
}

#[instrument(skip_all)]
pub async fn count_voters(pool: &Pool, database_id: &str) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM voters WHERE database_id = ?")
        .bind(database_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn count_local_only(pool: &Pool, database_id: &str) -> Result<i64> {
    let count =
        sqlx::query_scalar("SELECT COUNT(*) FROM voters WHERE database_id = ? AND sync_state = ?")
            .bind(database_id)
            .bind(SyncState::LocalOnly.as_str())
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn clear_voters(pool: &Pool, database_id: &str) -> Result<u64> {
    let done = sqlx::query("DELETE FROM voters WHERE database_id = ?")
        .bind(database_id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}

/// Local-first edit: merge `patch` into the stored voter (creating it when
/// absent), mark it `LocalOnly` and queue the patch, all in one transaction.
#[instrument(skip_all, fields(record_id = %record_id))]
pub async fn apply_local_edit(
    pool: &Pool,
    database_id: &str,
    record_id: &str,
    patch: &Patch,
) -> Result<VoterRecord> {
    let record_id = record_id.trim();
    if record_id.is_empty() {
        bail!("record id must not be empty");
    }

    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let mut record = fetch_voter(&mut tx, database_id, record_id)
        .await?
        .unwrap_or_else(|| VoterRecord::empty(record_id, now));
    record.apply_patch(patch, now);
    record.sync_state = SyncState::LocalOnly;
    upsert_voter(&mut tx, database_id, &record).await?;
    enqueue_outbox_tx(
        &mut tx,
        database_id,
        record_id,
        OutboxOperation::Upsert,
        patch,
        now,
    )
    .await?;
    tx.commit().await?;
    Ok(record)
}

#[instrument(skip_all)]
pub async fn enqueue_outbox(
    pool: &Pool,
    database_id: &str,
    record_id: &str,
    operation: OutboxOperation,
    payload: &Patch,
    updated_at: DateTime<Utc>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let seq = enqueue_outbox_tx(&mut tx, database_id, record_id, operation, payload, updated_at)
        .await?;
    tx.commit().await?;
    Ok(seq)
}

async fn enqueue_outbox_tx(
    conn: &mut SqliteConnection,
    database_id: &str,
    record_id: &str,
    operation: OutboxOperation,
    payload: &Patch,
    updated_at: DateTime<Utc>,
) -> Result<i64> {
    let payload = serde_json::to_string(payload)?;
    let seq = sqlx::query_scalar(
        "INSERT INTO outbox (database_id, record_id, operation, payload, updated_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING seq",
    )
    .bind(database_id)
    .bind(record_id)
    .bind(operation.as_str())
    .bind(payload)
    .bind(updated_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(seq)
}

/// All queued entries for a database, oldest first.
#[instrument(skip_all)]
pub async fn list_outbox(pool: &Pool, database_id: &str) -> Result<Vec<OutboxEntry>> {
    let rows = sqlx::query_as::<_, OutboxRow>(SELECT_OUTBOX)
        .bind(database_id)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(OutboxEntry::try_from).collect()
}

#[instrument(skip_all)]
pub async fn count_outbox(pool: &Pool, database_id: &str) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE database_id = ?")
        .bind(database_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Remove acknowledged entries by sequence number. Voters left without any
/// queued entry become `Confirmed`.
#[instrument(skip_all, fields(count = seqs.len()))]
pub async fn delete_outbox_many(pool: &Pool, database_id: &str, seqs: &[i64]) -> Result<u64> {
    if seqs.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    let mut deleted = 0u64;
    let mut touched = BTreeSet::new();
    for seq in seqs {
        let record_id: Option<String> = sqlx::query_scalar(
            "DELETE FROM outbox WHERE database_id = ? AND seq = ? RETURNING record_id",
        )
        .bind(database_id)
        .bind(seq)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(record_id) = record_id {
            deleted += 1;
            touched.insert(record_id);
        }
    }
    for record_id in touched {
        sqlx::query(
            "UPDATE voters SET sync_state = ? WHERE database_id = ? AND id = ? \
             AND NOT EXISTS (SELECT 1 FROM outbox WHERE database_id = ? AND record_id = ?)",
        )
        .bind(SyncState::Confirmed.as_str())
        .bind(database_id)
        .bind(&record_id)
        .bind(database_id)
        .bind(&record_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(deleted)
}

#[instrument(skip_all)]
pub async fn meta_get(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

#[instrument(skip_all)]
pub async fn meta_put(pool: &Pool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO meta (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .with_context(|| format!("failed to persist metadata {key}"))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn meta_delete(pool: &Pool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM meta WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await
        .with_context(|| format!("failed to delete metadata {key}"))?;
    Ok(())
}

/// Drop every voter and outbox entry of a database plus the given metadata
/// keys, atomically.
#[instrument(skip_all)]
pub async fn reset_database(pool: &Pool, database_id: &str, meta_keys: &[String]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM voters WHERE database_id = ?")
        .bind(database_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM outbox WHERE database_id = ?")
        .bind(database_id)
        .execute(&mut *tx)
        .await?;
    for key in meta_keys {
        sqlx::query("DELETE FROM meta WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}
