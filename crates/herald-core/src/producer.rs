//! Constructors for the item kinds the assistant tools produce.
//!
//! Each builder validates its inputs, mints a fresh `request_id` and stamps
//! the creation time. Appending to the queue is the caller's job
//! (`QueueStore::append`), so every producer shares the store's locking.

use serde_json::{Map, Value};

use crate::errors::ProducerError;
use crate::item::{parse_iso_timestamp, QueueItem};

pub const KIND_REMINDER: &str = "reminder";
pub const KIND_GUIDEMAP: &str = "guidemap";
pub const KIND_TIMER: &str = "timer";

pub const ACTION_ADD: &str = "add";
pub const ACTION_START: &str = "start";

/// Reminder at `parsed_time`, keeping the user's original phrasing.
pub fn reminder(
    title: &str,
    original_text: &str,
    parsed_time: &str,
) -> Result<QueueItem, ProducerError> {
    require("title", title)?;
    validate_time(parsed_time)?;

    let mut payload = Map::new();
    payload.insert("title".into(), Value::from(title));
    payload.insert("time".into(), Value::from(parsed_time));
    payload.insert("original_text".into(), Value::from(original_text));
    Ok(QueueItem::new(KIND_REMINDER, ACTION_ADD, payload))
}

/// Navigation request. `parsed_time` is validated but not carried in the payload.
pub fn guidemap(
    destination: &str,
    mode: &str,
    parsed_time: &str,
) -> Result<QueueItem, ProducerError> {
    require("destination", destination)?;
    validate_time(parsed_time)?;

    let mut payload = Map::new();
    payload.insert("destination".into(), Value::from(destination));
    payload.insert("mode".into(), Value::from(mode));
    Ok(QueueItem::new(KIND_GUIDEMAP, ACTION_ADD, payload))
}

/// Countdown timer.
pub fn timer(duration_seconds: u64, title: &str) -> QueueItem {
    let mut payload = Map::new();
    payload.insert("title".into(), Value::from(title));
    payload.insert("duration_seconds".into(), Value::from(duration_seconds));
    QueueItem::new(KIND_TIMER, ACTION_START, payload)
}

fn require(field: &'static str, value: &str) -> Result<(), ProducerError> {
    if value.trim().is_empty() {
        return Err(ProducerError::MissingField(field));
    }
    Ok(())
}

fn validate_time(raw: &str) -> Result<(), ProducerError> {
    parse_iso_timestamp(raw)
        .map(|_| ())
        .ok_or_else(|| ProducerError::InvalidTime(raw.to_string()))
}
