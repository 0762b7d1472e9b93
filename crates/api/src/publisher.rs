use std::sync::Arc;

use tracing::warn;

use orderflow_events::{Event, EventBus, RawEnvelope};
use orderflow_infra::{OutboxStore, OutboxTask, StoreError};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The bus refused the event; it was queued for the outbox relay.
    Queued,
}

/// Publishes order-side events, falling back to the outbox when the bus is
/// down so that a committed order never loses its notification.
pub struct OutboxPublisher {
    bus: Arc<dyn EventBus>,
    outbox: Arc<dyn OutboxStore>,
}

impl OutboxPublisher {
    pub fn new(bus: Arc<dyn EventBus>, outbox: Arc<dyn OutboxStore>) -> Self {
        Self { bus, outbox }
    }

    /// Fails only when the event could neither be published nor queued.
    pub async fn publish<E: Event>(&self, event: E) -> Result<PublishOutcome, StoreError> {
        let event_type = event.event_type();
        let envelope =
            RawEnvelope::wrap(event).map_err(|e| StoreError::Invalid(e.to_string()))?;

        match self.bus.publish(envelope.clone()).await {
            Ok(()) => Ok(PublishOutcome::Published),
            Err(e) => {
                warn!(event_type, error = %e, "bus publish failed, queueing in outbox");
                self.outbox.enqueue(OutboxTask::Publish { envelope }).await?;
                Ok(PublishOutcome::Queued)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use orderflow_core::OrderId;
    use orderflow_events::{BusError, InMemoryEventBus, Subscription, Topic};
    use orderflow_infra::InMemoryOutbox;
    use orderflow_orders::{OrderEvent, OrderStatus};

    use super::*;

    struct DownBus;

    #[async_trait]
    impl EventBus for DownBus {
        async fn publish(&self, _: RawEnvelope) -> Result<(), BusError> {
            Err(BusError::Unavailable("connection refused".into()))
        }

        async fn subscribe(&self, _: Topic, _: &str) -> Result<Subscription, BusError> {
            Err(BusError::Unavailable("connection refused".into()))
        }
    }

    fn event() -> OrderEvent {
        OrderEvent::OrderStatusChanged {
            order_id: OrderId::new(),
            product_name: orderflow_core::ProductName::parse("widget").unwrap(),
            status: OrderStatus::Shipped,
        }
    }

    #[tokio::test]
    async fn publishes_directly_when_the_bus_is_up() {
        let bus = Arc::new(InMemoryEventBus::new());
        let outbox = Arc::new(InMemoryOutbox::new());
        let publisher = OutboxPublisher::new(bus.clone(), outbox.clone());

        assert_eq!(publisher.publish(event()).await.unwrap(), PublishOutcome::Published);
        assert_eq!(bus.published(Topic::Orders).len(), 1);
        assert!(outbox.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queues_when_the_bus_is_down() {
        let outbox = Arc::new(InMemoryOutbox::new());
        let publisher = OutboxPublisher::new(Arc::new(DownBus), outbox.clone());

        assert_eq!(publisher.publish(event()).await.unwrap(), PublishOutcome::Queued);
        let pending = outbox.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task.kind(), "publish");
    }
}
