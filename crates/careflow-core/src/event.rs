//! Domain events consumed from the appointment/encounter lifecycle.
//!
//! Producers live outside the engine; this is the ingestion contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named lifecycle moment that activates rule matching.
///
/// The well-known values are closed over what the appointment lifecycle
/// emits today; `Custom` keeps the set open for new producers without a
/// schema change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TriggerEvent {
    Created,
    Confirmed,
    Completed,
    Cancelled,
    Custom(String),
}

impl TriggerEvent {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Custom(s) => s,
        }
    }
}

impl From<String> for TriggerEvent {
    fn from(s: String) -> Self {
        match s.as_str() {
            "created" => Self::Created,
            "confirmed" => Self::Confirmed,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for TriggerEvent {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<TriggerEvent> for String {
    fn from(t: TriggerEvent) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A lifecycle event as delivered by an external producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// The subject the event is about (patient, appointment, encounter id).
    pub subject_id: String,
    /// Subject kind, e.g. "appointment" or "encounter".
    pub subject_type: String,
    pub trigger_event: TriggerEvent,
    /// When the lifecycle moment occurred.
    pub event_time: DateTime<Utc>,
    /// Attributes the rule conditions are evaluated against.
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Reference time for negative delays ("N minutes before X"),
    /// e.g. the appointment start. Not every event has one.
    #[serde(default)]
    pub anchor_time: Option<DateTime<Utc>>,
    /// Identifies this occurrence of the event; the idempotency key for
    /// duplicate delivery.
    pub occurrence_id: String,
}

impl DomainEvent {
    pub fn new(
        subject_id: &str,
        subject_type: &str,
        trigger_event: TriggerEvent,
        event_time: DateTime<Utc>,
        occurrence_id: &str,
    ) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            subject_type: subject_type.to_string(),
            trigger_event,
            event_time,
            attributes: serde_json::Map::new(),
            anchor_time: None,
            occurrence_id: occurrence_id.to_string(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn with_anchor(mut self, anchor: DateTime<Utc>) -> Self {
        self.anchor_time = Some(anchor);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_event_open_set() {
        assert_eq!(TriggerEvent::from("created"), TriggerEvent::Created);
        assert_eq!(
            TriggerEvent::from("no_show"),
            TriggerEvent::Custom("no_show".into())
        );
        assert_eq!(TriggerEvent::from("no_show").as_str(), "no_show");
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::json!({
            "subject_id": "appt-1",
            "subject_type": "appointment",
            "trigger_event": "confirmed",
            "event_time": "2024-01-01T10:00:00Z",
            "occurrence_id": "occ-1"
        });
        let event: DomainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.trigger_event, TriggerEvent::Confirmed);
        assert!(event.anchor_time.is_none());
        assert!(event.attributes.is_empty());
    }
}
