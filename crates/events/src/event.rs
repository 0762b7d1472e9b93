use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Named fanout channel an event is published on.
///
/// Every consumer group subscribed to a topic receives every event published
/// to it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Order lifecycle: order created, status changed.
    Orders,
    /// Product catalogue and stock changes.
    Inventory,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Orders, Topic::Inventory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Orders => "orders",
            Topic::Inventory => "inventory",
        }
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed integration event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - **idempotent to consume** (delivery is at-least-once)
pub trait Event: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable event name (e.g. "order.created").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// Topic the event is published on.
    fn topic(&self) -> Topic;

    /// Natural key consumers deduplicate on (e.g. the order id). Redeliveries
    /// of the same fact share it. `None` falls back to the envelope's event id.
    fn idempotency_key(&self) -> Option<String> {
        None
    }
}
