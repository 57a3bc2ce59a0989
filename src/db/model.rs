//! Row shapes returned by repository queries.
//!
//! JSON columns are decoded here so the repository stays focused on SQL.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::model::{OutboxEntry, OutboxOperation, Patch, SyncState, VoterRecord};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VoterRow {
    pub id: String,
    pub name: String,
    pub name_lower: String,
    pub voter_identifier: String,
    pub voter_identifier_lower: String,
    pub mobile: String,
    pub booth_or_part: String,
    pub serial: String,
    pub attributes: String,
    pub raw_fields: String,
    pub sync_state: String,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<VoterRow> for VoterRecord {
    type Error = anyhow::Error;

    fn try_from(row: VoterRow) -> Result<Self> {
        let attributes: BTreeMap<String, String> = serde_json::from_str(&row.attributes)
            .with_context(|| format!("voter {} has malformed attributes", row.id))?;
        let raw_fields = serde_json::from_str(&row.raw_fields)
            .with_context(|| format!("voter {} has malformed raw fields", row.id))?;
        let sync_state = SyncState::parse_state(&row.sync_state)
            .ok_or_else(|| anyhow!("voter {} has unknown sync state {}", row.id, row.sync_state))?;
        Ok(VoterRecord {
            id: row.id,
            name: row.name,
            voter_identifier: row.voter_identifier,
            mobile: row.mobile,
            booth_or_part: row.booth_or_part,
            serial: row.serial,
            attributes,
            raw_fields,
            name_lower: row.name_lower,
            voter_identifier_lower: row.voter_identifier_lower,
            sync_state,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub seq: i64,
    pub database_id: String,
    pub record_id: String,
    pub operation: String,
    pub payload: String,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = anyhow::Error;

    fn try_from(row: OutboxRow) -> Result<Self> {
        let operation = OutboxOperation::parse_operation(&row.operation)
            .ok_or_else(|| anyhow!("outbox entry {} has unknown operation {}", row.seq, row.operation))?;
        let payload: Patch = serde_json::from_str(&row.payload)
            .with_context(|| format!("outbox entry {} has malformed payload", row.seq))?;
        Ok(OutboxEntry {
            seq: row.seq,
            database_id: row.database_id,
            record_id: row.record_id,
            operation,
            payload,
            updated_at: row.updated_at,
        })
    }
}
