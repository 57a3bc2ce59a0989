//! Offline search over the local store.
//!
//! [`ScanSearch`] walks every record of the session's database once per
//! query, in store insertion order. Structured filters run first, then a
//! case-insensitive substring match of the query text against the configured
//! fields. Callers depend on [`VoterSearch`] only, so an indexed
//! implementation can replace the scan later.

use anyhow::Result;
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::db::{self, Pool};
use crate::model::VoterRecord;
use crate::normalizer::{search_key, value_to_text};
use crate::session::Session;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchField {
    Name,
    VoterIdentifier,
    Mobile,
    /// Values of the source row; a last-resort match.
    RawFields,
}

pub const DEFAULT_FIELDS: [SearchField; 2] = [SearchField::Name, SearchField::VoterIdentifier];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
    pub filters: BTreeMap<String, String>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: String::new(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            filters: BTreeMap::new(),
        }
    }
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    fn offset(&self) -> (usize, usize) {
        let page = self.page.max(1) as usize;
        let size = self.page_size.max(1) as usize;
        ((page - 1) * size, size)
    }

    /// Filters with a non-blank value, trimmed and lowercased.
    fn active_filters(&self) -> Vec<(&str, String)> {
        self.filters
            .iter()
            .filter_map(|(key, value)| {
                let value = value.trim();
                (!value.is_empty()).then(|| (key.as_str(), value.to_lowercase()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub items: Vec<VoterRecord>,
    /// Number of records matching the query across all pages.
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
}

#[async_trait]
pub trait VoterSearch: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage>;
}

fn matches_filters(record: &VoterRecord, filters: &[(&str, String)]) -> bool {
    filters
        .iter()
        .all(|(key, wanted)| record.field_value(key).trim().to_lowercase() == *wanted)
}

fn matches_text(record: &VoterRecord, needle: &str, fields: &[SearchField]) -> bool {
    if needle.is_empty() {
        return true;
    }
    fields.iter().any(|field| match field {
        SearchField::Name => record.name_lower.contains(needle),
        SearchField::VoterIdentifier => record.voter_identifier_lower.contains(needle),
        SearchField::Mobile => search_key(&record.mobile).contains(needle),
        SearchField::RawFields => record
            .raw_fields
            .values()
            .any(|value| search_key(&value_to_text(value)).contains(needle)),
    })
}

#[derive(Debug, Clone)]
pub struct ScanSearch {
    pool: Pool,
    session: Session,
    fields: Vec<SearchField>,
}

impl ScanSearch {
    pub fn new(pool: Pool, session: Session) -> Self {
        Self {
            pool,
            session,
            fields: DEFAULT_FIELDS.to_vec(),
        }
    }

    /// Replace the searched fields. An empty list keeps the defaults.
    pub fn with_fields(mut self, fields: Vec<SearchField>) -> Self {
        if !fields.is_empty() {
            self.fields = fields;
        }
        self
    }

    pub fn fields(&self) -> &[SearchField] {
        &self.fields
    }
}

#[async_trait]
impl VoterSearch for ScanSearch {
    #[instrument(skip_all, fields(database_id = %self.session.database_id()))]
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage> {
        let needle = search_key(&query.text);
        let filters = query.active_filters();
        let (skip, take) = query.offset();

        let mut total = 0usize;
        let mut items = Vec::new();
        let mut records = db::scan_voters(&self.pool, self.session.database_id());
        while let Some(record) = records.try_next().await? {
            if !matches_filters(&record, &filters) || !matches_text(&record, &needle, &self.fields)
            {
                continue;
            }
            if total >= skip && items.len() < take {
                items.push(record);
            }
            total += 1;
        }
        debug!(total, returned = items.len(), "search finished");

        Ok(SearchPage {
            items,
            total,
            page: query.page.max(1),
            page_size: query.page_size.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn voter(id: &str, name: &str, booth: &str) -> VoterRecord {
        let mut rec = VoterRecord::empty(id, Utc::now());
        rec.name = name.into();
        rec.booth_or_part = booth.into();
        rec.mobile = "98 220 11".into();
        rec.raw_fields.insert("village".into(), json!("Shirur"));
        rec.refresh_search_keys();
        rec
    }

    #[test]
    fn blank_filter_values_are_ignored() {
        let query = SearchQuery::new("")
            .filter("booth", "  ")
            .filter("gender", " F ");
        assert_eq!(query.active_filters(), vec![("gender", "f".to_string())]);
    }

    #[test]
    fn filters_compare_trimmed_and_case_insensitive() {
        let rec = voter("1", "Asha", " 12A ");
        assert!(matches_filters(&rec, &[("part", "12a".into())]));
        assert!(!matches_filters(&rec, &[("booth", "12".into())]));
        assert!(matches_filters(&rec, &[("village", "shirur".into())]));
    }

    #[test]
    fn text_match_uses_only_configured_fields() {
        let rec = voter("1", "Asha Patil", "12");
        assert!(matches_text(&rec, "patil", &DEFAULT_FIELDS));
        assert!(!matches_text(&rec, "shirur", &DEFAULT_FIELDS));
        assert!(matches_text(&rec, "shirur", &[SearchField::RawFields]));
        assert!(matches_text(&rec, "98 220", &[SearchField::Mobile]));
        assert!(matches_text(&rec, "", &[]));
    }

    #[test]
    fn zero_page_and_size_are_clamped() {
        let query = SearchQuery::new("x").page(0).page_size(0);
        assert_eq!(query.offset(), (0, 1));
        assert_eq!(SearchQuery::new("x").page(3).page_size(20).offset(), (40, 20));
    }
}
