//! Integration events and the publish/subscribe mechanics that carry them.
//!
//! Domain crates define their own typed events and implement [`Event`]; on the
//! bus every event travels as an [`EventEnvelope`] with a JSON payload and is
//! decoded back into its typed form by the consumer.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{Acknowledge, BusError, Delivery, EventBus, Subscription};
pub use envelope::{EventEnvelope, RawEnvelope};
pub use event::{Event, Topic};
pub use handler::{EventHandler, HandlerError};
pub use in_memory_bus::InMemoryEventBus;
