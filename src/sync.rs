//! Pull, push and reset orchestration for one logical database.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::db::{self, Pool};
use crate::gateway::{GatewayError, PageRequest, RejectedChange, RemoteGateway};
use crate::normalizer::{IdSource, Normalizer};
use crate::outbox;
use crate::session::Session;

pub const WATERMARK_PREFIX: &str = "lastSync:";
pub const BOUND_DATABASE_KEY: &str = "boundDatabase";
pub const DEFAULT_PAGE_SIZE: u32 = 500;

pub fn watermark_key(database_id: &str) -> String {
    format!("{WATERMARK_PREFIX}{database_id}")
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] GatewayError),
    #[error("local store failed: {0:#}")]
    Storage(anyhow::Error),
    #[error("database {database_id} is busy ({phase:?} in progress)")]
    Busy {
        database_id: String,
        phase: SyncPhase,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Pulling,
    Pushing,
    Resetting,
}

/// Per-database exclusion: at most one pull, push or reset at a time.
#[derive(Debug, Clone, Default)]
pub struct SyncLocks {
    active: Arc<Mutex<HashMap<String, SyncPhase>>>,
}

impl SyncLocks {
    pub fn phase(&self, database_id: &str) -> SyncPhase {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.get(database_id).copied().unwrap_or(SyncPhase::Idle)
    }

    fn begin(&self, database_id: &str, phase: SyncPhase) -> Result<PhaseGuard, SyncError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = active.get(database_id) {
            return Err(SyncError::Busy {
                database_id: database_id.to_string(),
                phase: *current,
            });
        }
        active.insert(database_id.to_string(), phase);
        Ok(PhaseGuard {
            locks: self.clone(),
            database_id: database_id.to_string(),
        })
    }
}

struct PhaseGuard {
    locks: SyncLocks,
    database_id: String,
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        let mut active = self.locks.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.database_id);
    }
}

/// Cooperative cancellation, observed between pages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullProgress {
    pub page: u32,
    pub batch_size: usize,
    pub total_so_far: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pulled: usize,
    pub pages: u32,
    pub cancelled: bool,
    pub watermark: Option<DateTime<Utc>>,
    pub watermark_advanced: bool,
    pub synthesized_ids: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    pub failed: usize,
    pub rejected: Vec<RejectedChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub database_id: String,
    pub watermark: Option<DateTime<Utc>>,
    pub voters: i64,
    pub local_only: i64,
    pub pending_outbox: i64,
    pub phase: SyncPhase,
}

pub type ProgressObserver<'a> = &'a mut (dyn FnMut(PullProgress) + Send);

pub struct SyncEngine {
    pool: Pool,
    gateway: Arc<dyn RemoteGateway>,
    session: Session,
    normalizer: Normalizer,
    page_size: u32,
    locks: SyncLocks,
}

impl SyncEngine {
    pub fn new(pool: Pool, gateway: Arc<dyn RemoteGateway>, session: Session) -> Self {
        Self {
            pool,
            gateway,
            session,
            normalizer: Normalizer::default(),
            page_size: DEFAULT_PAGE_SIZE,
            locks: SyncLocks::default(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Share exclusion state with other engines over the same store.
    pub fn with_locks(mut self, locks: SyncLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn locks(&self) -> &SyncLocks {
        &self.locks
    }

    pub async fn watermark(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        read_watermark(&self.pool, self.session.database_id()).await
    }

    /// Page through remote changes since the stored watermark and merge them
    /// into the local store. Each page is committed before the next fetch; a
    /// failed fetch leaves earlier pages in place and the watermark untouched.
    #[instrument(skip_all, fields(database_id = %self.session.database_id()))]
    pub async fn pull(
        &self,
        observer: Option<ProgressObserver<'_>>,
        cancel: &CancelFlag,
    ) -> Result<PullReport, SyncError> {
        let guard = self.locks.begin(self.session.database_id(), SyncPhase::Pulling)?;
        self.pull_locked(&guard, observer, cancel).await
    }

    /// Pull body; the caller already holds the database's guard.
    async fn pull_locked(
        &self,
        _guard: &PhaseGuard,
        mut observer: Option<ProgressObserver<'_>>,
        cancel: &CancelFlag,
    ) -> Result<PullReport, SyncError> {
        let database_id = self.session.database_id();
        let since = read_watermark(&self.pool, database_id).await?;
        let mut report = PullReport {
            watermark: since,
            ..PullReport::default()
        };
        let mut newest = since;
        let mut page = 1u32;
        info!(since = ?since, page_size = self.page_size, "pull started");

        loop {
            if cancel.is_cancelled() {
                info!(page, "pull cancelled");
                report.cancelled = true;
                break;
            }

            let request = PageRequest {
                database_id: database_id.to_string(),
                since,
                page,
                page_size: self.page_size,
                query: None,
            };
            let response = self.gateway.fetch_page(&request).await.map_err(|err| {
                warn!(?err, page, "page fetch failed; pull aborted");
                SyncError::from(err)
            })?;

            let batch_size = response.items.len();
            // Rows without their own timestamp take the page's server time.
            let now = response.server_time.unwrap_or_else(Utc::now);
            let records: Vec<_> = response
                .items
                .iter()
                .map(|item| {
                    let normalized = self.normalizer.normalize_at(item, now);
                    if normalized.id_source == IdSource::Random {
                        report.synthesized_ids += 1;
                    }
                    normalized.record
                })
                .collect();
            db::merge_pulled_voters(&self.pool, database_id, records)
                .await
                .map_err(SyncError::Storage)?;

            report.pulled += batch_size;
            report.pages = page;
            if let Some(server_time) = response.server_time {
                if newest.map_or(true, |current| server_time > current) {
                    newest = Some(server_time);
                }
            }
            info!(page, batch_size, total_so_far = report.pulled, "page merged");
            if let Some(observer) = observer.as_mut() {
                observer(PullProgress {
                    page,
                    batch_size,
                    total_so_far: report.pulled,
                });
            }

            if !response.has_more || batch_size == 0 {
                break;
            }
            page += 1;
        }

        if let Some(advanced) = newest.filter(|ts| since.map_or(true, |s| *ts > s)) {
            write_watermark(&self.pool, database_id, advanced).await?;
            report.watermark = Some(advanced);
            report.watermark_advanced = true;
        }
        info!(
            pulled = report.pulled,
            pages = report.pages,
            cancelled = report.cancelled,
            advanced = report.watermark_advanced,
            "pull finished"
        );
        Ok(report)
    }

    /// Forget the watermark and pull everything again. Local data and pending
    /// edits are kept. The database stays locked from the watermark reset
    /// until the pull ends.
    #[instrument(skip_all, fields(database_id = %self.session.database_id()))]
    pub async fn resync(
        &self,
        observer: Option<ProgressObserver<'_>>,
        cancel: &CancelFlag,
    ) -> Result<PullReport, SyncError> {
        let database_id = self.session.database_id();
        let guard = self.locks.begin(database_id, SyncPhase::Pulling)?;
        db::meta_delete(&self.pool, &watermark_key(database_id))
            .await
            .map_err(SyncError::Storage)?;
        self.pull_locked(&guard, observer, cancel).await
    }

    /// Send the pending outbox as one batch.
    #[instrument(skip_all, fields(database_id = %self.session.database_id()))]
    pub async fn push(&self) -> Result<PushReport, SyncError> {
        let database_id = self.session.database_id();
        let _guard = self.locks.begin(database_id, SyncPhase::Pushing)?;
        outbox::push_pending(&self.pool, self.gateway.as_ref(), database_id).await
    }

    /// Drop all local voters, queued edits and the watermark of the session's
    /// database.
    #[instrument(skip_all, fields(database_id = %self.session.database_id()))]
    pub async fn reset(&self) -> Result<(), SyncError> {
        let database_id = self.session.database_id();
        let _guard = self.locks.begin(database_id, SyncPhase::Resetting)?;
        reset_local(&self.pool, database_id).await
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        let database_id = self.session.database_id();
        let storage = SyncError::Storage;
        Ok(SyncStatus {
            database_id: database_id.to_string(),
            watermark: read_watermark(&self.pool, database_id).await?,
            voters: db::count_voters(&self.pool, database_id).await.map_err(storage)?,
            local_only: db::count_local_only(&self.pool, database_id)
                .await
                .map_err(storage)?,
            pending_outbox: db::count_outbox(&self.pool, database_id)
                .await
                .map_err(storage)?,
            phase: self.locks.phase(database_id),
        })
    }
}

async fn reset_local(pool: &Pool, database_id: &str) -> Result<(), SyncError> {
    let pending = db::count_outbox(pool, database_id)
        .await
        .map_err(SyncError::Storage)?;
    if pending > 0 {
        warn!(database_id, pending, "discarding unpushed edits");
    }
    db::reset_database(pool, database_id, &[watermark_key(database_id)])
        .await
        .map_err(SyncError::Storage)?;
    info!(database_id, "local database reset");
    Ok(())
}

async fn read_watermark(pool: &Pool, database_id: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
    let stored = db::meta_get(pool, &watermark_key(database_id))
        .await
        .map_err(SyncError::Storage)?;
    Ok(stored.and_then(|raw| match DateTime::parse_from_rfc3339(&raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(err) => {
            warn!(database_id, %raw, ?err, "ignoring unreadable watermark");
            None
        }
    }))
}

async fn write_watermark(
    pool: &Pool,
    database_id: &str,
    at: DateTime<Utc>,
) -> Result<(), SyncError> {
    db::meta_put(
        pool,
        &watermark_key(database_id),
        &at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    )
    .await
    .map_err(SyncError::Storage)
}

/// Record which database this device works against. Switching to another id
/// resets the previously bound database; returns that id when it happened.
#[instrument(skip_all, fields(database_id = %database_id))]
pub async fn bind_database(pool: &Pool, database_id: &str) -> Result<Option<String>, SyncError> {
    let previous = db::meta_get(pool, BOUND_DATABASE_KEY)
        .await
        .map_err(SyncError::Storage)?;
    if previous.as_deref() == Some(database_id) {
        return Ok(None);
    }
    if let Some(prev) = previous.as_deref() {
        info!(previous = prev, "switching bound database");
        reset_local(pool, prev).await?;
    }
    db::meta_put(pool, BOUND_DATABASE_KEY, database_id)
        .await
        .map_err(SyncError::Storage)?;
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_key_is_per_database() {
        assert_eq!(watermark_key("ward-7"), "lastSync:ward-7");
    }

    #[test]
    fn locks_are_exclusive_per_database_and_released_on_drop() {
        let locks = SyncLocks::default();
        let guard = locks.begin("a", SyncPhase::Pulling).unwrap();
        assert_eq!(locks.phase("a"), SyncPhase::Pulling);
        assert!(matches!(
            locks.begin("a", SyncPhase::Pushing),
            Err(SyncError::Busy { phase: SyncPhase::Pulling, .. })
        ));
        let other = locks.begin("b", SyncPhase::Pushing).unwrap();
        drop(guard);
        assert_eq!(locks.phase("a"), SyncPhase::Idle);
        assert!(locks.begin("a", SyncPhase::Pushing).is_ok());
        drop(other);
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let handle = flag.clone();
        assert!(!flag.is_cancelled());
        handle.cancel();
        assert!(flag.is_cancelled());
    }
}
