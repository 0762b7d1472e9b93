use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use orderflow_core::EventId;

use crate::event::{Event, Topic};

/// Envelope as it travels over the bus: metadata plus a JSON payload.
pub type RawEnvelope = EventEnvelope<JsonValue>;

/// Envelope for an event, carrying routing and deduplication metadata.
///
/// Notes:
/// - `topic` selects the fanout channel.
/// - `idempotency_key` is stable across redeliveries of the same fact; for
///   order events it is the order id.
/// - `payload` is internally tagged by `type`, so consumers decode it into
///   their typed event enum instead of inspecting strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    topic: Topic,
    event_type: String,
    version: u32,
    idempotency_key: String,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl<E: Event> EventEnvelope<E> {
    pub fn new(event: E) -> Self {
        let event_id = EventId::new();
        Self {
            event_id,
            topic: event.topic(),
            event_type: event.event_type().to_string(),
            version: event.version(),
            idempotency_key: event
                .idempotency_key()
                .unwrap_or_else(|| event_id.to_string()),
            occurred_at: Utc::now(),
            payload: event,
        }
    }

    /// Serialize the payload for transport.
    pub fn into_raw(self) -> Result<RawEnvelope, serde_json::Error> {
        Ok(EventEnvelope {
            event_id: self.event_id,
            topic: self.topic,
            event_type: self.event_type,
            version: self.version,
            idempotency_key: self.idempotency_key,
            occurred_at: self.occurred_at,
            payload: serde_json::to_value(&self.payload)?,
        })
    }
}

impl RawEnvelope {
    /// Wrap and serialize a typed event in one step.
    pub fn wrap<E: Event>(event: E) -> Result<Self, serde_json::Error> {
        EventEnvelope::new(event).into_raw()
    }

    /// Decode the JSON payload into a typed event.
    pub fn decode<E: Event>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
