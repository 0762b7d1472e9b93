use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{OrderId, ProductName};
use orderflow_events::{Event, Topic};

use crate::order::{Order, OrderStatus};

/// Events published by the order service on the `orders` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    /// An order was persisted. In event-driven mode this is also the trigger
    /// for the inventory decrement.
    OrderCreated {
        order_id: OrderId,
        product_name: ProductName,
        quantity: i64,
        unit_price: u64,
        created_at: DateTime<Utc>,
    },
    OrderStatusChanged {
        order_id: OrderId,
        product_name: ProductName,
        status: OrderStatus,
    },
}

impl OrderEvent {
    pub fn created(order: &Order) -> Self {
        OrderEvent::OrderCreated {
            order_id: order.id,
            product_name: order.product_name.clone(),
            quantity: order.quantity,
            unit_price: order.unit_price,
            created_at: order.created_at,
        }
    }

    pub fn status_changed(order: &Order) -> Self {
        OrderEvent::OrderStatusChanged {
            order_id: order.id,
            product_name: order.product_name.clone(),
            status: order.status,
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            OrderEvent::OrderCreated { order_id, .. } => *order_id,
            OrderEvent::OrderStatusChanged { order_id, .. } => *order_id,
        }
    }
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated { .. } => "order.created",
            OrderEvent::OrderStatusChanged { .. } => "order.status_changed",
        }
    }

    fn topic(&self) -> Topic {
        Topic::Orders
    }

    fn idempotency_key(&self) -> Option<String> {
        match self {
            OrderEvent::OrderCreated { order_id, .. } => Some(order_id.to_string()),
            OrderEvent::OrderStatusChanged {
                order_id, status, ..
            } => Some(format!("{order_id}:{status}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use orderflow_events::RawEnvelope;

    use super::*;
    use crate::placement::PlaceOrder;

    #[test]
    fn order_created_is_keyed_by_order_id() {
        let order = Order::place(&PlaceOrder::new("widget", 2).unwrap(), 100, Utc::now());
        let env = RawEnvelope::wrap(OrderEvent::created(&order)).unwrap();

        assert_eq!(env.topic(), Topic::Orders);
        assert_eq!(env.event_type(), "order.created");
        assert_eq!(env.idempotency_key(), order.id.to_string());
        assert_eq!(env.payload()["type"], "order_created");

        let decoded: OrderEvent = env.decode().unwrap();
        assert_eq!(decoded.order_id(), order.id);
    }
}
