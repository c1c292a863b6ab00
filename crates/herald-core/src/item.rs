use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ids::ItemId;

/// One pending record in the relay queue.
///
/// The relay only looks at `request_id`; `kind`, `action` and `payload` belong
/// to producers and clients. Optional fields are written back only when the
/// stored record had them, and unknown top-level fields ride along in
/// `extra`, so a broadcast is the record as the producer wrote it (modulo
/// whitespace).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub request_id: ItemId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Kept as any JSON value; `null` survives a rewrite.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A field that is present in the document is `Some`, even when it holds `null`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl QueueItem {
    pub fn new(
        kind: impl Into<String>,
        action: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            request_id: ItemId::new(),
            kind: kind.into(),
            action: Some(action.into()),
            payload: Some(Value::Object(payload)),
            timestamp: Some(now_timestamp()),
            extra: Map::new(),
        }
    }

    /// Field of an object payload.
    pub fn payload_field(&self, key: &str) -> Option<&Value> {
        self.payload.as_ref()?.get(key)
    }

    /// Compact JSON text frame sent to clients.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Local wall-clock time with second precision and no offset
/// (`2025-03-01T09:30:00`), the format producers have always written.
pub fn now_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parse an ISO-8601 timestamp with or without an offset, or a bare date.
///
/// Naive values are interpreted in the local timezone.
pub fn parse_iso_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt);
    }
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.fixed_offset())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "request_id": "A",
            "type": "reminder",
            "action": "add",
            "payload": {"title": "stretch", "time": "2025-03-01T09:30:00", "original_text": "in ten minutes"},
            "timestamp": "2025-03-01T09:20:00"
        })
    }

    #[test]
    fn deserializes_producer_shape() {
        let item: QueueItem = serde_json::from_value(sample()).unwrap();
        assert_eq!(item.request_id.as_str(), "A");
        assert_eq!(item.kind, "reminder");
        assert_eq!(item.action.as_deref(), Some("add"));
        assert_eq!(item.payload_field("title").unwrap(), "stretch");
        assert!(item.extra.is_empty());
    }

    #[test]
    fn wire_form_keeps_field_names_and_order() {
        let item: QueueItem = serde_json::from_value(sample()).unwrap();
        let wire = item.to_wire().unwrap();
        assert!(wire.starts_with(r#"{"request_id":"A","type":"reminder","action":"add","payload":{"title":"stretch""#));
        let back: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let mut raw = sample();
        raw["priority"] = json!(3);
        let item: QueueItem = serde_json::from_value(raw).unwrap();
        assert_eq!(item.extra["priority"], 3);
        let wire: Value = serde_json::from_str(&item.to_wire().unwrap()).unwrap();
        assert_eq!(wire["priority"], 3);
    }

    #[test]
    fn minimal_record_goes_out_unchanged() {
        let raw = r#"{"request_id":"B","type":"timer"}"#;
        let item: QueueItem = serde_json::from_str(raw).unwrap();
        assert!(item.action.is_none());
        assert!(item.payload.is_none());
        assert!(item.timestamp.is_none());
        assert_eq!(item.to_wire().unwrap(), raw);
    }

    #[test]
    fn null_payload_is_kept() {
        let raw = r#"{"request_id":"B","type":"timer","payload":null}"#;
        let item: QueueItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.payload, Some(Value::Null));
        assert!(item.payload_field("title").is_none());
        assert_eq!(item.to_wire().unwrap(), raw);
    }

    #[test]
    fn non_object_payload_is_kept() {
        let raw = r#"{"request_id":"C","type":"note","action":"add","payload":"plain text"}"#;
        let item: QueueItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.to_wire().unwrap(), raw);
    }

    #[test]
    fn request_id_is_required() {
        let err = serde_json::from_value::<QueueItem>(json!({"type": "timer"}));
        assert!(err.is_err());
    }

    #[test]
    fn new_item_has_fresh_id_and_timestamp() {
        let a = QueueItem::new("timer", "start", Map::new());
        let b = QueueItem::new("timer", "start", Map::new());
        assert_ne!(a.request_id, b.request_id);
        let stamp = a.timestamp.as_deref().unwrap();
        assert!(parse_iso_timestamp(stamp).is_some(), "timestamp: {stamp}");
    }

    #[test]
    fn parses_iso_variants() {
        assert!(parse_iso_timestamp("2025-03-01T09:30:00").is_some());
        assert!(parse_iso_timestamp("2025-03-01T09:30:00.250").is_some());
        assert!(parse_iso_timestamp("2025-03-01T09:30").is_some());
        assert!(parse_iso_timestamp("2025-03-01 09:30:00").is_some());
        assert!(parse_iso_timestamp("2025-03-01").is_some());
        let with_offset = parse_iso_timestamp("2025-03-01T09:30:00+08:00").unwrap();
        assert_eq!(with_offset.offset().local_minus_utc(), 8 * 3600);
    }

    #[test]
    fn rejects_non_iso() {
        assert!(parse_iso_timestamp("tomorrow at nine").is_none());
        assert!(parse_iso_timestamp("").is_none());
        assert!(parse_iso_timestamp("2025-13-01T00:00:00").is_none());
    }
}
