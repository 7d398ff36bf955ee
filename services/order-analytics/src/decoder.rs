//! Event decoder
//!
//! Turns raw broker payload bytes into an `OrderEvent`. Pure function, no
//! side effects. Unknown event types are not a failure; they decode with
//! `EventType::Unknown` and the router decides what to do with them.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use types::ids::{EventId, OrderId, UserId};

use crate::error::DecodeError;
use crate::events::{EventType, OrderEvent};

/// Naive layouts the order service emits (no offset, implicitly UTC).
const NAIVE_LAYOUTS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Decode a single broker message payload.
pub fn decode(bytes: &[u8]) -> Result<OrderEvent, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    let payload = match value {
        Value::Object(map) => map,
        other => {
            return Err(DecodeError::MalformedPayload(format!(
                "expected JSON object, got {}",
                json_kind(&other)
            )))
        }
    };

    let event_type = payload
        .get("eventType")
        .and_then(Value::as_str)
        .map(EventType::from_wire)
        .unwrap_or_else(|| EventType::Unknown("unknown".to_string()));

    let order_id = id_field(&payload, "orderId")
        .map(OrderId::new)
        .ok_or(DecodeError::MissingField("orderId"))?;

    let user_id = id_field(&payload, "userId")
        .map(UserId::new)
        .unwrap_or_default();

    let timestamp = match payload.get("timestamp") {
        Some(Value::String(s)) => {
            parse_timestamp(s).ok_or_else(|| DecodeError::InvalidTimestamp(s.clone()))?
        }
        Some(other) => return Err(DecodeError::InvalidTimestamp(other.to_string())),
        None => return Err(DecodeError::InvalidTimestamp(String::new())),
    };

    let event_id = payload
        .get("eventId")
        .and_then(Value::as_str)
        .and_then(EventId::parse)
        .unwrap_or_default();

    Ok(OrderEvent {
        event_id,
        event_type,
        order_id,
        user_id,
        timestamp,
        payload,
    })
}

/// Parse an ISO-8601 timestamp. Offset-less values are taken as UTC;
/// offset values are converted to UTC, so they bucket by their UTC hour.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(s, layout).ok())
        .map(|naive| naive.and_utc())
}

/// Ids arrive as strings (UUIDs) but tolerate numeric ids.
fn id_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
