use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::normalizer::{search_key, value_to_text, CanonicalField};

/// Partial record update as produced by a local edit, keyed by canonical
/// camelCase field names. Unknown keys land in `raw_fields`; an object under
/// [`RAW_FIELDS_KEY`] replaces them wholesale.
pub type Patch = Map<String, Value>;

pub const RAW_FIELDS_KEY: &str = "rawFields";

/// Whether the remote side has acknowledged the latest local state of a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    LocalOnly,
    Confirmed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::LocalOnly => "local_only",
            SyncState::Confirmed => "confirmed",
        }
    }

    pub fn parse_state(value: &str) -> Option<Self> {
        match value {
            "local_only" => Some(SyncState::LocalOnly),
            "confirmed" => Some(SyncState::Confirmed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOperation {
    Upsert,
}

impl OutboxOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOperation::Upsert => "upsert",
        }
    }

    pub fn parse_operation(value: &str) -> Option<Self> {
        match value {
            "upsert" => Some(OutboxOperation::Upsert),
            _ => None,
        }
    }
}

/// Canonical voter row as stored locally and searched offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterRecord {
    pub id: String,
    pub name: String,
    pub voter_identifier: String,
    pub mobile: String,
    pub booth_or_part: String,
    pub serial: String,
    /// Secondary canonical attributes (gender, age, address, house number).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// The source row exactly as received.
    #[serde(default)]
    pub raw_fields: Map<String, Value>,
    pub name_lower: String,
    pub voter_identifier_lower: String,
    pub sync_state: SyncState,
    pub updated_at: DateTime<Utc>,
}

impl VoterRecord {
    /// An empty record carrying only an id, used as the base for edits to
    /// records that do not exist locally yet.
    pub fn empty(id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            voter_identifier: String::new(),
            mobile: String::new(),
            booth_or_part: String::new(),
            serial: String::new(),
            attributes: BTreeMap::new(),
            raw_fields: Map::new(),
            name_lower: String::new(),
            voter_identifier_lower: String::new(),
            sync_state: SyncState::LocalOnly,
            updated_at: at,
        }
    }

    /// Recompute the derived lowercase keys from the display fields.
    pub fn refresh_search_keys(&mut self) {
        self.name_lower = search_key(&self.name);
        self.voter_identifier_lower = search_key(&self.voter_identifier);
    }

    /// Merge a partial update into this record and stamp it with `at`.
    pub fn apply_patch(&mut self, patch: &Patch, at: DateTime<Utc>) {
        for (key, value) in patch {
            match CanonicalField::from_key(key) {
                Some(CanonicalField::Name) => self.name = value_to_text(value),
                Some(CanonicalField::VoterIdentifier) => {
                    self.voter_identifier = value_to_text(value)
                }
                Some(CanonicalField::Mobile) => self.mobile = value_to_text(value),
                Some(CanonicalField::BoothOrPart) => self.booth_or_part = value_to_text(value),
                Some(CanonicalField::Serial) => self.serial = value_to_text(value),
                Some(field) if field.is_attribute() => {
                    let text = value_to_text(value);
                    if text.is_empty() {
                        self.attributes.remove(field.key());
                    } else {
                        self.attributes.insert(field.key().to_string(), text);
                    }
                }
                // Identity and timestamps are not patchable.
                Some(_) => {}
                None if key == RAW_FIELDS_KEY => {
                    if let Value::Object(raw) = value {
                        self.raw_fields = raw.clone();
                    }
                }
                None => {
                    self.raw_fields.insert(key.clone(), value.clone());
                }
            }
        }
        self.refresh_search_keys();
        if at > self.updated_at {
            self.updated_at = at;
        }
    }

    /// Look up a field by filter key: canonical names first, then attributes,
    /// then raw source fields. Missing fields read as empty.
    pub fn field_value(&self, key: &str) -> Cow<'_, str> {
        match CanonicalField::from_filter_key(key) {
            Some(CanonicalField::Id) => Cow::Borrowed(&self.id),
            Some(CanonicalField::Name) => Cow::Borrowed(&self.name),
            Some(CanonicalField::VoterIdentifier) => Cow::Borrowed(&self.voter_identifier),
            Some(CanonicalField::Mobile) => Cow::Borrowed(&self.mobile),
            Some(CanonicalField::BoothOrPart) => Cow::Borrowed(&self.booth_or_part),
            Some(CanonicalField::Serial) => Cow::Borrowed(&self.serial),
            Some(field) if field.is_attribute() => self
                .attributes
                .get(field.key())
                .map(|v| Cow::Borrowed(v.as_str()))
                .unwrap_or(Cow::Borrowed("")),
            _ => self
                .raw_fields
                .get(key)
                .map(|v| Cow::Owned(value_to_text(v)))
                .unwrap_or(Cow::Borrowed("")),
        }
    }

    /// Equal in everything a remote row can carry; timestamps and local
    /// sync state are not compared.
    pub fn same_content(&self, other: &VoterRecord) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.voter_identifier == other.voter_identifier
            && self.mobile == other.mobile
            && self.booth_or_part == other.booth_or_part
            && self.serial == other.serial
            && self.attributes == other.attributes
            && self.raw_fields == other.raw_fields
    }

    /// Upsert payload for this record: non-empty canonical values, attributes
    /// and the source row under `rawFields`. Blank fields are left out so the
    /// payload never clears a value another edit set.
    pub fn to_payload(&self) -> Patch {
        let mut payload = Patch::new();
        let fields = [
            ("name", &self.name),
            ("voterIdentifier", &self.voter_identifier),
            ("mobile", &self.mobile),
            ("boothOrPart", &self.booth_or_part),
            ("serial", &self.serial),
        ];
        for (key, value) in fields {
            if !value.is_empty() {
                payload.insert(key.into(), Value::String(value.clone()));
            }
        }
        for (key, value) in &self.attributes {
            payload.insert(key.clone(), Value::String(value.clone()));
        }
        if !self.raw_fields.is_empty() {
            payload.insert(RAW_FIELDS_KEY.into(), Value::Object(self.raw_fields.clone()));
        }
        payload
    }
}

/// A queued, not yet acknowledged local change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub seq: i64,
    pub database_id: String,
    pub record_id: String,
    pub operation: OutboxOperation,
    pub payload: Patch,
    pub updated_at: DateTime<Utc>,
}
