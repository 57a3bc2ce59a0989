//! Wire types for the remote search/export and bulk-upsert endpoints.
//!
//! Responses are parsed leniently: the export endpoint may answer with an
//! object envelope or a bare array, and key spellings vary between
//! deployments.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use super::GatewayError;
use crate::model::{OutboxEntry, OutboxOperation, Patch};
use crate::normalizer::{parse_timestamp, value_to_text};

const ITEM_KEYS: &[&str] = &["items", "data", "voters", "results"];
const HAS_MORE_KEYS: &[&str] = &["hasMore", "has_more", "more"];
const SERVER_TIME_KEYS: &[&str] = &["serverTime", "server_time"];
const ACCEPTED_KEYS: &[&str] = &["successIds", "acceptedIds", "success_ids"];
const REJECTED_KEYS: &[&str] = &["failed", "rejected"];
const REASON_KEYS: &[&str] = &["error", "reason", "message"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub database_id: String,
    /// Only records updated at or after this instant; `None` is a full export.
    pub since: Option<DateTime<Utc>>,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
    pub query: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Map<String, Value>>,
    pub has_more: bool,
    pub server_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: String,
    pub operation: OutboxOperation,
    pub payload: Patch,
    pub updated_at: DateTime<Utc>,
}

impl From<&OutboxEntry> for Change {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            id: entry.record_id.clone(),
            operation: entry.operation,
            payload: entry.payload.clone(),
            updated_at: entry.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub database_id: String,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedChange {
    pub id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub accepted_ids: Vec<String>,
    pub rejected: Vec<RejectedChange>,
}

fn first_present<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| map.get(*key))
}

fn full_page(len: usize, page_size: u32) -> bool {
    page_size > 0 && len >= page_size as usize
}

fn object_items(items: &[Value]) -> Vec<Map<String, Value>> {
    let objects: Vec<_> = items
        .iter()
        .filter_map(|item| item.as_object().cloned())
        .collect();
    if objects.len() != items.len() {
        warn!(
            skipped = items.len() - objects.len(),
            "ignoring non-object items in page"
        );
    }
    objects
}

/// Parse one export page. A bare array has no server time and is considered
/// to continue while pages come back full.
pub fn parse_page(body: &str, page_size: u32) -> Result<Page, GatewayError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| GatewayError::Payload(err.to_string()))?;
    match value {
        Value::Array(items) => {
            let items = object_items(&items);
            let has_more = full_page(items.len(), page_size);
            Ok(Page {
                items,
                has_more,
                server_time: None,
            })
        }
        Value::Object(map) => {
            let items = first_present(&map, ITEM_KEYS)
                .and_then(Value::as_array)
                .map(|items| object_items(items))
                .ok_or_else(|| GatewayError::Payload("response has no items array".into()))?;
            let has_more = first_present(&map, HAS_MORE_KEYS)
                .and_then(Value::as_bool)
                .unwrap_or_else(|| full_page(items.len(), page_size));
            let server_time = first_present(&map, SERVER_TIME_KEYS).and_then(parse_timestamp);
            Ok(Page {
                items,
                has_more,
                server_time,
            })
        }
        _ => Err(GatewayError::Payload(
            "expected a JSON object or array".into(),
        )),
    }
}

/// Parse the bulk-upsert acknowledgement. A missing id list acknowledges
/// nothing.
pub fn parse_push_outcome(body: &str) -> Result<PushOutcome, GatewayError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| GatewayError::Payload(err.to_string()))?;
    let Value::Object(map) = value else {
        return Err(GatewayError::Payload(
            "expected a JSON object acknowledgement".into(),
        ));
    };

    let accepted_ids = first_present(&map, ACCEPTED_KEYS)
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .map(value_to_text)
                .filter(|id| !id.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let rejected = first_present(&map, REJECTED_KEYS)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(rejected_change).collect())
        .unwrap_or_default();

    Ok(PushOutcome {
        accepted_ids,
        rejected,
    })
}

fn rejected_change(item: &Value) -> Option<RejectedChange> {
    let (id, reason) = match item {
        Value::Object(map) => (
            map.get("id").map(value_to_text).unwrap_or_default(),
            first_present(map, REASON_KEYS)
                .map(value_to_text)
                .filter(|r| !r.is_empty()),
        ),
        other => (value_to_text(other), None),
    };
    (!id.is_empty()).then_some(RejectedChange { id, reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn parses_object_envelope() {
        let body = json!({
            "items": [{"id": 1}, {"id": 2}],
            "hasMore": true,
            "serverTime": "2024-05-01T10:00:00Z"
        })
        .to_string();
        let page = parse_page(&body, 50).unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
        assert_eq!(
            page.server_time,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn parses_bare_array_by_page_fill() {
        let full = json!([{"id": 1}, {"id": 2}]).to_string();
        let page = parse_page(&full, 2).unwrap();
        assert!(page.has_more);
        assert!(page.server_time.is_none());

        let short = json!([{"id": 1}]).to_string();
        assert!(!parse_page(&short, 2).unwrap().has_more);
    }

    #[test]
    fn accepts_alternate_keys_and_epoch_time() {
        let body = json!({"data": [{"id": "a"}, 7], "has_more": false, "server_time": 1_714_557_600_000i64})
            .to_string();
        let page = parse_page(&body, 10).unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(!page.has_more);
        assert!(page.server_time.is_some());
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(parse_page("not json", 10), Err(GatewayError::Payload(_))));
        assert!(matches!(parse_page("{\"count\": 3}", 10), Err(GatewayError::Payload(_))));
        assert!(matches!(parse_page("42", 10), Err(GatewayError::Payload(_))));
    }

    #[test]
    fn parses_push_acknowledgement() {
        let body = json!({
            "successIds": ["A", 3],
            "failed": ["B", {"id": "C", "error": "stale"}, {"reason": "no id"}]
        })
        .to_string();
        let outcome = parse_push_outcome(&body).unwrap();
        assert_eq!(outcome.accepted_ids, vec!["A".to_string(), "3".to_string()]);
        assert_eq!(
            outcome.rejected,
            vec![
                RejectedChange { id: "B".into(), reason: None },
                RejectedChange { id: "C".into(), reason: Some("stale".into()) },
            ]
        );
    }

    #[test]
    fn missing_ack_list_acknowledges_nothing() {
        let outcome = parse_push_outcome("{}").unwrap();
        assert!(outcome.accepted_ids.is_empty());
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn change_serializes_camel_case() {
        let change = Change {
            id: "A".into(),
            operation: OutboxOperation::Upsert,
            payload: json!({"mobile": "99"}).as_object().cloned().unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        };
        let value = serde_json::to_value(PushRequest {
            database_id: "db".into(),
            changes: vec![change],
        })
        .unwrap();
        assert_eq!(value["databaseId"], "db");
        assert_eq!(value["changes"][0]["operation"], "upsert");
        assert_eq!(value["changes"][0]["payload"]["mobile"], "99");
        assert_eq!(value["changes"][0]["updatedAt"], "2024-01-02T03:04:05Z");
    }
}
