//! The JSON envelope carried by every broker record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::events::IntegrationEvent;

/// Wire format of every message: `{timestamp, type, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// When the event was created by its producer.
    pub timestamp: DateTime<Utc>,

    /// The event type name (e.g. `"StockDecreased"`).
    #[serde(rename = "type")]
    pub event_type: String,

    /// The event body.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Wraps an integration event, stamping it with the current time.
    pub fn wrap<E: IntegrationEvent>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            timestamp: Utc::now(),
            event_type: E::EVENT_TYPE.to_string(),
            payload: serde_json::to_value(event)?,
        })
    }

    /// Serializes the envelope to its JSON string form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses an envelope from its JSON string form.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Decodes the payload into a concrete event type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
