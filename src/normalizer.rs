//! Canonicalization of voter rows whose field names differ by source and
//! language.
//!
//! Field resolution is driven by [`AliasTable`], an ordered list of accepted
//! source keys per canonical field. The table is plain data so deployments can
//! extend it from configuration without touching the resolution code.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::model::{SyncState, VoterRecord};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Id,
    Name,
    VoterIdentifier,
    Mobile,
    BoothOrPart,
    Serial,
    Gender,
    Age,
    Address,
    HouseNumber,
    UpdatedAt,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 11] = [
        CanonicalField::Id,
        CanonicalField::Name,
        CanonicalField::VoterIdentifier,
        CanonicalField::Mobile,
        CanonicalField::BoothOrPart,
        CanonicalField::Serial,
        CanonicalField::Gender,
        CanonicalField::Age,
        CanonicalField::Address,
        CanonicalField::HouseNumber,
        CanonicalField::UpdatedAt,
    ];

    /// Key used for this field in canonical records and patches.
    pub const fn key(self) -> &'static str {
        match self {
            CanonicalField::Id => "id",
            CanonicalField::Name => "name",
            CanonicalField::VoterIdentifier => "voterIdentifier",
            CanonicalField::Mobile => "mobile",
            CanonicalField::BoothOrPart => "boothOrPart",
            CanonicalField::Serial => "serial",
            CanonicalField::Gender => "gender",
            CanonicalField::Age => "age",
            CanonicalField::Address => "address",
            CanonicalField::HouseNumber => "houseNumber",
            CanonicalField::UpdatedAt => "updatedAt",
        }
    }

    pub const fn is_attribute(self) -> bool {
        matches!(
            self,
            CanonicalField::Gender
                | CanonicalField::Age
                | CanonicalField::Address
                | CanonicalField::HouseNumber
        )
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }

    /// Like [`CanonicalField::from_key`] but also accepts the short names
    /// callers use for structured filters.
    pub fn from_filter_key(key: &str) -> Option<Self> {
        match key {
            "booth" | "part" | "booth_or_part" => Some(CanonicalField::BoothOrPart),
            "voter_identifier" | "voterId" | "epic" => Some(CanonicalField::VoterIdentifier),
            "house_number" => Some(CanonicalField::HouseNumber),
            other => Self::from_key(other),
        }
    }
}

/// Built-in aliases. The canonical key comes first so canonical records
/// resolve to themselves.
const DEFAULT_ALIASES: &[(CanonicalField, &[&str])] = &[
    (
        CanonicalField::Id,
        &["id", "_id", "voterUid", "uid", "recordId", "record_id"],
    ),
    (
        CanonicalField::Name,
        &[
            "name",
            "Name",
            "fullName",
            "full_name",
            "voterName",
            "voter_name",
            "Voter Name",
            "नाव",
            "मतदाराचे नाव",
            "मतदाराचे पूर्ण नाव",
            "नाम",
            "मतदाता का नाम",
        ],
    ),
    (
        CanonicalField::VoterIdentifier,
        &[
            "voterIdentifier",
            "voterId",
            "voter_id",
            "epic",
            "EPIC",
            "epicNo",
            "epic_no",
            "EPIC No",
            "cardNo",
            "card_no",
            "ओळखपत्र क्रमांक",
            "मतदार ओळखपत्र",
            "मतदाता पहचान पत्र",
            "पहचान पत्र संख्या",
        ],
    ),
    (
        CanonicalField::Mobile,
        &[
            "mobile",
            "Mobile",
            "mobileNo",
            "mobile_no",
            "phone",
            "Phone",
            "मोबाईल",
            "मोबाईल नंबर",
            "मोबाइल",
            "फोन",
        ],
    ),
    (
        CanonicalField::BoothOrPart,
        &[
            "boothOrPart",
            "booth",
            "Booth",
            "boothNo",
            "booth_no",
            "part",
            "Part",
            "partNo",
            "part_no",
            "Part No",
            "भाग क्रमांक",
            "यादी भाग क्र",
            "बूथ",
            "भाग संख्या",
        ],
    ),
    (
        CanonicalField::Serial,
        &[
            "serial",
            "Serial",
            "serialNo",
            "serial_no",
            "srNo",
            "sr_no",
            "Sr No",
            "अनुक्रमांक",
            "अ.क्र",
            "क्रमांक",
            "क्रम संख्या",
        ],
    ),
    (CanonicalField::Gender, &["gender", "Gender", "sex", "लिंग"]),
    (CanonicalField::Age, &["age", "Age", "वय", "आयु"]),
    (
        CanonicalField::Address,
        &["address", "Address", "पत्ता", "पता"],
    ),
    (
        CanonicalField::HouseNumber,
        &[
            "houseNumber",
            "houseNo",
            "house_no",
            "House No",
            "घर क्रमांक",
            "मकान संख्या",
        ],
    ),
    (
        CanonicalField::UpdatedAt,
        &[
            "updatedAt",
            "updated_at",
            "modifiedAt",
            "modified_at",
            "lastModified",
        ],
    ),
];

/// Ordered source-key preferences per canonical field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasTable {
    entries: BTreeMap<CanonicalField, Vec<String>>,
}

impl Default for AliasTable {
    fn default() -> Self {
        let entries = DEFAULT_ALIASES
            .iter()
            .map(|(field, aliases)| {
                (*field, aliases.iter().map(|a| (*a).to_string()).collect())
            })
            .collect();
        Self { entries }
    }
}

impl AliasTable {
    /// Append extra aliases after the built-in ones, skipping duplicates.
    pub fn with_extra(mut self, extra: &BTreeMap<CanonicalField, Vec<String>>) -> Self {
        for (field, aliases) in extra {
            let list = self.entries.entry(*field).or_default();
            for alias in aliases {
                let alias = alias.trim();
                if !alias.is_empty() && !list.iter().any(|a| a == alias) {
                    list.push(alias.to_string());
                }
            }
        }
        self
    }

    pub fn aliases(&self, field: CanonicalField) -> &[String] {
        self.entries.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First alias present in `source` with a non-empty value.
    pub fn resolve(&self, field: CanonicalField, source: &Map<String, Value>) -> Option<String> {
        self.aliases(field)
            .iter()
            .filter_map(|alias| source.get(alias))
            .map(value_to_text)
            .find(|text| !text.is_empty())
    }

    fn resolve_value<'a>(
        &self,
        field: CanonicalField,
        source: &'a Map<String, Value>,
    ) -> Option<&'a Value> {
        self.aliases(field)
            .iter()
            .filter_map(|alias| source.get(alias))
            .find(|value| !value_to_text(value).is_empty())
    }
}

/// Where a record's id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    Remote,
    VoterIdentifier,
    BoothSerial,
    /// Random token; re-importing the same source row yields a new record.
    Random,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub record: VoterRecord,
    pub id_source: IdSource,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    aliases: AliasTable,
}

impl Normalizer {
    pub fn new(aliases: AliasTable) -> Self {
        Self { aliases }
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn normalize(&self, input: &Map<String, Value>) -> Normalized {
        self.normalize_at(input, Utc::now())
    }

    /// Normalize with an explicit fallback timestamp for rows that carry none.
    pub fn normalize_at(&self, input: &Map<String, Value>, now: DateTime<Utc>) -> Normalized {
        // Already-canonical input keeps its original source row and exposes
        // its attributes at the top level for resolution.
        let raw_fields = match input.get("rawFields") {
            Some(Value::Object(raw)) => raw.clone(),
            _ => input.clone(),
        };
        let mut view = input.clone();
        if let Some(Value::Object(attributes)) = input.get("attributes") {
            for (key, value) in attributes {
                view.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        let text = |field| self.aliases.resolve(field, &view).unwrap_or_default();
        let name = text(CanonicalField::Name);
        let voter_identifier = text(CanonicalField::VoterIdentifier);
        let mobile = text(CanonicalField::Mobile);
        let booth_or_part = text(CanonicalField::BoothOrPart);
        let serial = text(CanonicalField::Serial);

        let attributes = CanonicalField::ALL
            .into_iter()
            .filter(|field| field.is_attribute())
            .filter_map(|field| {
                self.aliases
                    .resolve(field, &view)
                    .map(|value| (field.key().to_string(), value))
            })
            .collect();

        let updated_at = self
            .aliases
            .resolve_value(CanonicalField::UpdatedAt, &view)
            .and_then(parse_timestamp)
            .unwrap_or(now);

        // Canonical input may already carry its local sync state.
        let sync_state = input
            .get("syncState")
            .and_then(Value::as_str)
            .and_then(SyncState::parse_state)
            .unwrap_or(SyncState::Confirmed);

        let (id, id_source) = match self.aliases.resolve(CanonicalField::Id, &view) {
            Some(id) => (id, IdSource::Remote),
            None => synthesize_id(&voter_identifier, &booth_or_part, &serial),
        };
        if id_source == IdSource::Random {
            warn!(%id, "voter row has no natural key; assigned a random id");
        }

        let mut record = VoterRecord {
            id,
            name,
            voter_identifier,
            mobile,
            booth_or_part,
            serial,
            attributes,
            raw_fields,
            name_lower: String::new(),
            voter_identifier_lower: String::new(),
            sync_state,
            updated_at,
        };
        record.refresh_search_keys();
        Normalized { record, id_source }
    }
}

fn synthesize_id(voter_identifier: &str, booth: &str, serial: &str) -> (String, IdSource) {
    let identifier = search_key(voter_identifier).replace(' ', "");
    if !identifier.is_empty() {
        return (format!("epic:{identifier}"), IdSource::VoterIdentifier);
    }
    let booth = booth.trim();
    let serial = serial.trim();
    if !booth.is_empty() && !serial.is_empty() {
        return (format!("part:{booth}:{serial}"), IdSource::BoothSerial);
    }
    (uuid::Uuid::new_v4().to_string(), IdSource::Random)
}

/// Lowercased, trimmed text with inner whitespace runs collapsed to one space.
pub fn search_key(value: &str) -> String {
    WHITESPACE
        .replace_all(value.trim(), " ")
        .to_lowercase()
}

/// Text form of a scalar JSON value. Containers and null read as empty.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => String::new(),
    }
}

/// Parse an RFC 3339 string or epoch milliseconds (number or digit string).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc));
            }
            s.parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        }
        _ => None,
    }
}
