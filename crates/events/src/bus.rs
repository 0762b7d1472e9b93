//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern**: a durable fanout channel for
//! distributing events to every interested service.
//!
//! ## Delivery contract
//!
//! - **Fanout per consumer group**: each group subscribed to a topic receives
//!   every event on that topic; consumers sharing a group split the load.
//! - **Durable**: events published while a group has no connected consumer are
//!   delivered once one connects.
//! - **At-least-once**: a delivery that is not acknowledged may be delivered
//!   again, so consumers must be idempotent.
//! - **Ordered per topic** for a single publisher; no ordering across topics.
//!
//! Publishing never panics. A publish failure is reported as
//! [`BusError::Unavailable`] and the caller decides whether to retry later; the
//! state change that produced the event stays committed either way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::RawEnvelope;
use crate::event::Topic;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// The broker could not be reached or refused the operation.
    #[error("event bus unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within its deadline.
    #[error("event bus operation timed out after {0:?}")]
    Timeout(Duration),

    /// The envelope could not be encoded or decoded.
    #[error("event serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BusError {
    fn from(value: serde_json::Error) -> Self {
        BusError::Serialization(value.to_string())
    }
}

/// Confirms to the broker that a delivery was processed.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;
}

/// One received envelope plus the means to acknowledge it.
pub struct Delivery {
    envelope: RawEnvelope,
    acker: Option<Box<dyn Acknowledge>>,
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("acknowledgeable", &self.acker.is_some())
            .finish()
    }
}

impl Delivery {
    /// A delivery that needs no acknowledgment (in-memory transports).
    pub fn unacknowledged(envelope: RawEnvelope) -> Self {
        Self { envelope, acker: None }
    }

    pub fn with_acker(envelope: RawEnvelope, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            envelope,
            acker: Some(acker),
        }
    }

    pub fn envelope(&self) -> &RawEnvelope {
        &self.envelope
    }

    /// Mark the delivery as processed. Unacknowledged deliveries may come back.
    pub async fn ack(self) -> Result<(), BusError> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

/// A subscription to one topic on behalf of one consumer group.
///
/// The sequence is lazy and unending: `recv` waits for the next delivery and
/// only returns `None` once the bus side has shut down.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(topic: Topic, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { topic, receiver }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait until the next delivery is available.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Take a delivery if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

/// Domain-agnostic event bus.
///
/// ```text
/// Store mutation (committed) → EventBus::publish → consumer groups
///                                                   ├─ inventory-service
///                                                   └─ order-service
/// ```
///
/// The trait requires `Send + Sync`: one bus client is constructed at startup
/// and shared by every request task and background worker.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: RawEnvelope) -> Result<(), BusError>;

    /// Join `group` on `topic`, declaring the group if it does not exist yet.
    async fn subscribe(&self, topic: Topic, group: &str) -> Result<Subscription, BusError>;
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    async fn publish(&self, envelope: RawEnvelope) -> Result<(), BusError> {
        (**self).publish(envelope).await
    }

    async fn subscribe(&self, topic: Topic, group: &str) -> Result<Subscription, BusError> {
        (**self).subscribe(topic, group).await
    }
}
