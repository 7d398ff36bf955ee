//! Order lifecycle event definitions
//!
//! Defines `OrderEvent`, the immutable record produced by the decoder for
//! every broker message, and the closed `EventType` set the router
//! dispatches on. Event-specific fields stay in a loosely typed payload map
//! because producers attach more than the aggregates need (line items,
//! shipping details), and the raw payload is what gets mirrored to the
//! recent-activity window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use types::ids::{EventId, OrderId, UserId};
use types::numeric::{Amount, AmountError};

/// Lifecycle event kinds.
///
/// `Unknown` keeps the raw type string so that new producer event kinds
/// decode cleanly and can be logged before being dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Created,
    StatusChanged,
    Cancelled,
    Unknown(String),
}

impl EventType {
    /// Resolve a wire `eventType` string.
    ///
    /// Accepts the producer spelling (`ORDER_CREATED`), the handler-style
    /// spelling (`OrderCreatedEvent`) and the bare name (`Created`),
    /// ignoring case.
    pub fn from_wire(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        let normalized = normalized
            .strip_prefix("order")
            .unwrap_or(&normalized);
        let normalized = normalized.strip_suffix("event").unwrap_or(normalized);

        match normalized {
            "created" => EventType::Created,
            "statuschanged" => EventType::StatusChanged,
            "cancelled" | "canceled" => EventType::Cancelled,
            _ => EventType::Unknown(raw.to_string()),
        }
    }

    /// Get the event type as a string label for logging.
    pub fn label(&self) -> &str {
        match self {
            EventType::Created => "Created",
            EventType::StatusChanged => "StatusChanged",
            EventType::Cancelled => "Cancelled",
            EventType::Unknown(raw) => raw,
        }
    }
}

/// A decoded order lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Producer-supplied or locally assigned event id
    pub event_id: EventId,
    pub event_type: EventType,
    pub order_id: OrderId,
    pub user_id: UserId,
    /// Event time, normalized to UTC
    pub timestamp: DateTime<Utc>,
    /// The full wire object as received
    pub payload: Map<String, Value>,
}

impl OrderEvent {
    pub fn event_type_label(&self) -> &str {
        self.event_type.label()
    }

    /// `totalAmount` of a Created event. Absent means zero.
    pub fn total_amount(&self) -> Result<Amount, AmountError> {
        match self.payload.get("totalAmount") {
            None | Some(Value::Null) => Ok(Amount::ZERO),
            Some(v) => Amount::from_json(v),
        }
    }

    /// Previous status of a StatusChanged event, `None` when absent or empty.
    pub fn old_status(&self) -> Option<&str> {
        self.string_field(&["oldStatus", "previousStatus"])
    }

    pub fn new_status(&self) -> Option<&str> {
        self.string_field(&["newStatus"])
    }

    pub fn reason(&self) -> Option<&str> {
        self.string_field(&["reason", "cancellationReason"])
    }

    fn string_field(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.payload.get(*k))
            .filter_map(Value::as_str)
            .find(|s| !s.is_empty())
    }

    /// The raw wire object, serialized for mirroring.
    pub fn raw_json(&self) -> String {
        Value::Object(self.payload.clone()).to_string()
    }
}
