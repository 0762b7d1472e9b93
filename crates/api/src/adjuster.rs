//! How a persisted order gets its inventory decremented.
//!
//! [`DirectAdjuster`] calls the inventory service synchronously and knows the
//! outcome before the request returns; [`EventDrivenAdjuster`] publishes
//! `OrderCreated` and learns about rejections later from the inventory topic.
//! Both are keyed by order id, so repeating an adjustment is harmless.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use orderflow_inventory::RejectionReason;
use orderflow_orders::{Order, OrderEvent};

use crate::inventory_client::{InventoryClient, InventoryClientError};
use crate::publisher::OutboxPublisher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdjustOutcome {
    /// The decrement is applied.
    Applied,
    /// The decrement was handed to the inventory consumer.
    Deferred,
    /// The inventory service refused the decrement for good.
    Rejected(RejectionReason),
    /// The outcome is unknown; retry later.
    Unavailable(String),
}

#[async_trait]
pub trait InventoryAdjuster: Send + Sync {
    fn strategy(&self) -> &'static str;

    async fn adjust(&self, order: &Order) -> AdjustOutcome;
}

pub struct DirectAdjuster {
    inventory: Arc<dyn InventoryClient>,
}

impl DirectAdjuster {
    pub fn new(inventory: Arc<dyn InventoryClient>) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl InventoryAdjuster for DirectAdjuster {
    fn strategy(&self) -> &'static str {
        "direct"
    }

    async fn adjust(&self, order: &Order) -> AdjustOutcome {
        match self
            .inventory
            .apply_order_decrement(order.id, &order.product_name, order.quantity)
            .await
        {
            Ok(product) => {
                debug!(order_id = %order.id, remaining = product.quantity, "inventory decremented");
                AdjustOutcome::Applied
            }
            Err(InventoryClientError::NotFound) => {
                AdjustOutcome::Rejected(RejectionReason::ProductNotFound)
            }
            Err(InventoryClientError::Insufficient(_)) => {
                AdjustOutcome::Rejected(RejectionReason::InsufficientInventory)
            }
            Err(e) => AdjustOutcome::Unavailable(e.to_string()),
        }
    }
}

pub struct EventDrivenAdjuster {
    publisher: Arc<OutboxPublisher>,
}

impl EventDrivenAdjuster {
    pub fn new(publisher: Arc<OutboxPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl InventoryAdjuster for EventDrivenAdjuster {
    fn strategy(&self) -> &'static str {
        "event"
    }

    async fn adjust(&self, order: &Order) -> AdjustOutcome {
        match self.publisher.publish(OrderEvent::created(order)).await {
            Ok(_) => AdjustOutcome::Deferred,
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "could not hand off order decrement");
                AdjustOutcome::Unavailable(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use orderflow_core::{OrderId, ProductName};
    use orderflow_events::{InMemoryEventBus, Topic};
    use orderflow_infra::InMemoryOutbox;
    use orderflow_inventory::Product;
    use orderflow_orders::PlaceOrder;

    use super::*;

    struct Scripted(InventoryClientError);

    #[async_trait]
    impl InventoryClient for Scripted {
        async fn get_product(&self, _: &ProductName) -> Result<Product, InventoryClientError> {
            Err(self.0.clone())
        }

        async fn apply_order_decrement(
            &self,
            _: OrderId,
            _: &ProductName,
            _: i64,
        ) -> Result<Product, InventoryClientError> {
            Err(self.0.clone())
        }
    }

    fn order() -> Order {
        Order::place(&PlaceOrder::new("widget", 2).unwrap(), 100, Utc::now())
    }

    #[tokio::test]
    async fn direct_adjuster_classifies_failures() {
        let cases = [
            (
                InventoryClientError::NotFound,
                AdjustOutcome::Rejected(RejectionReason::ProductNotFound),
            ),
            (
                InventoryClientError::Insufficient("available: 1".into()),
                AdjustOutcome::Rejected(RejectionReason::InsufficientInventory),
            ),
        ];
        for (err, expected) in cases {
            let adjuster = DirectAdjuster::new(Arc::new(Scripted(err)));
            assert_eq!(adjuster.adjust(&order()).await, expected);
        }

        let adjuster = DirectAdjuster::new(Arc::new(Scripted(InventoryClientError::Timeout(
            Duration::from_secs(2),
        ))));
        assert!(matches!(adjuster.adjust(&order()).await, AdjustOutcome::Unavailable(_)));
    }

    #[tokio::test]
    async fn event_adjuster_publishes_order_created() {
        let bus = Arc::new(InMemoryEventBus::new());
        let publisher = Arc::new(OutboxPublisher::new(bus.clone(), Arc::new(InMemoryOutbox::new())));
        let adjuster = EventDrivenAdjuster::new(publisher);
        let order = order();

        assert_eq!(adjuster.adjust(&order).await, AdjustOutcome::Deferred);
        let published = bus.published(Topic::Orders);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type(), "order.created");
        assert_eq!(published[0].idempotency_key(), order.id.to_string());
    }
}
