//! Structured notifications emitted to external observers.
//!
//! Delivery mechanics (push stream, polling, message queue) belong to the
//! notification collaborator; this subsystem only states that something
//! happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use rxledger_core::AggregateId;

/// Classification of an observer-facing notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventClass {
    /// A stock level changed (receipt, consumption, write-off, adjustment).
    InventoryUpdate,
    /// An alert was raised or resolved.
    StockAlert,
    /// A batch entered the expiry-warning horizon or was expired.
    BatchExpiry,
}

/// One observer-facing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub class: EventClass,
    pub medicine_id: AggregateId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<AggregateId>,
    pub payload: JsonValue,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        class: EventClass,
        medicine_id: AggregateId,
        batch_id: Option<AggregateId>,
        payload: JsonValue,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            class,
            medicine_id,
            batch_id,
            payload,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_class_serializes_kebab_case() {
        let json = serde_json::to_string(&EventClass::InventoryUpdate).unwrap();
        assert_eq!(json, "\"inventory-update\"");
        let json = serde_json::to_string(&EventClass::StockAlert).unwrap();
        assert_eq!(json, "\"stock-alert\"");
        let json = serde_json::to_string(&EventClass::BatchExpiry).unwrap();
        assert_eq!(json, "\"batch-expiry\"");
    }
}
