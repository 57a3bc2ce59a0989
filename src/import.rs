use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{instrument, warn};

use crate::db::{self, Pool};
use crate::normalizer::{IdSource, Normalizer};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub synthesized_ids: usize,
}

/// Queue each row as a local edit. Blank cells never overwrite a stored
/// value and the stored source row becomes exactly the imported row.
#[instrument(skip_all, fields(database_id = %database_id, rows = rows.len()))]
pub async fn import_rows(
    pool: &Pool,
    database_id: &str,
    normalizer: &Normalizer,
    rows: &[Map<String, Value>],
) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    for row in rows {
        let normalized = normalizer.normalize(row);
        if normalized.id_source == IdSource::Random {
            report.synthesized_ids += 1;
        }
        let record = normalized.record;
        db::apply_local_edit(pool, database_id, &record.id, &record.to_payload()).await?;
        report.imported += 1;
    }
    if report.synthesized_ids > 0 {
        warn!(
            synthesized = report.synthesized_ids,
            "rows without a natural key were given random ids"
        );
    }
    Ok(report)
}
