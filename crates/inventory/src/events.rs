use serde::{Deserialize, Serialize};

use orderflow_core::{OrderId, ProductName};
use orderflow_events::{Event, Topic};

use crate::product::Product;

/// Why an order's decrement could not be applied.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    ProductNotFound,
    InsufficientInventory,
}

/// Events published by the inventory service on the `inventory` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InventoryEvent {
    ProductCreated {
        product: Product,
    },
    InventoryAdjusted {
        name: ProductName,
        delta: i64,
        /// On-hand quantity after the adjustment.
        quantity: i64,
        /// Set when the adjustment was an order decrement.
        order_id: Option<OrderId>,
    },
    ProductDeleted {
        name: ProductName,
    },
    /// An order decrement that was refused; the order service compensates.
    AdjustmentRejected {
        order_id: OrderId,
        name: ProductName,
        quantity: i64,
        reason: RejectionReason,
    },
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::ProductCreated { .. } => "inventory.product.created",
            InventoryEvent::InventoryAdjusted { .. } => "inventory.product.adjusted",
            InventoryEvent::ProductDeleted { .. } => "inventory.product.deleted",
            InventoryEvent::AdjustmentRejected { .. } => "inventory.adjustment.rejected",
        }
    }

    fn topic(&self) -> Topic {
        Topic::Inventory
    }

    fn idempotency_key(&self) -> Option<String> {
        match self {
            InventoryEvent::InventoryAdjusted {
                order_id: Some(order_id),
                ..
            } => Some(format!("adjusted:{order_id}")),
            InventoryEvent::AdjustmentRejected { order_id, .. } => {
                Some(format!("rejected:{order_id}"))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use orderflow_events::RawEnvelope;

    use super::*;

    #[test]
    fn payload_is_tagged_by_type() {
        let event = InventoryEvent::ProductDeleted {
            name: ProductName::parse("widget").unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "product_deleted");
        assert_eq!(json["name"], "widget");
    }

    #[test]
    fn rejection_is_keyed_by_order() {
        let order_id = OrderId::new();
        let env = RawEnvelope::wrap(InventoryEvent::AdjustmentRejected {
            order_id,
            name: ProductName::parse("widget").unwrap(),
            quantity: 3,
            reason: RejectionReason::InsufficientInventory,
        })
        .unwrap();

        assert_eq!(env.topic(), Topic::Inventory);
        assert_eq!(env.idempotency_key(), format!("rejected:{order_id}"));
        let back: InventoryEvent = env.decode().unwrap();
        assert!(matches!(back, InventoryEvent::AdjustmentRejected { .. }));
    }
}
