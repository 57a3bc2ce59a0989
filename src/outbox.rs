use std::collections::HashSet;
use tracing::{info, instrument, warn};

use crate::db::{self, Pool};
use crate::gateway::{Change, PushRequest, RemoteGateway};
use crate::sync::{PushReport, SyncError};

/// Send every queued change of `database_id` in one batch and drop the
/// entries the remote acknowledged. On transport failure nothing is removed.
#[instrument(skip_all, fields(database_id = %database_id))]
pub async fn push_pending(
    pool: &Pool,
    gateway: &dyn RemoteGateway,
    database_id: &str,
) -> Result<PushReport, SyncError> {
    let entries = db::list_outbox(pool, database_id)
        .await
        .map_err(SyncError::Storage)?;
    if entries.is_empty() {
        info!("outbox empty; nothing to push");
        return Ok(PushReport::default());
    }

    let request = PushRequest {
        database_id: database_id.to_string(),
        changes: entries.iter().map(Change::from).collect(),
    };
    let outcome = match gateway.push_changes(&request).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(?err, queued = entries.len(), "push failed; outbox kept");
            return Err(err.into());
        }
    };

    let accepted: HashSet<&str> = outcome.accepted_ids.iter().map(String::as_str).collect();
    let acked: Vec<i64> = entries
        .iter()
        .filter(|entry| accepted.contains(entry.record_id.as_str()))
        .map(|entry| entry.seq)
        .collect();
    db::delete_outbox_many(pool, database_id, &acked)
        .await
        .map_err(SyncError::Storage)?;

    for rejected in &outcome.rejected {
        warn!(id = %rejected.id, reason = ?rejected.reason, "change rejected by remote");
    }
    let report = PushReport {
        pushed: acked.len(),
        failed: entries.len() - acked.len(),
        rejected: outcome.rejected,
    };
    info!(pushed = report.pushed, failed = report.failed, "push finished");
    Ok(report)
}
