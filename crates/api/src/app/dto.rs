use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{OrderId, ProductName};
use orderflow_orders::{Order, OrderStatus};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: u64,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct AdjustInventoryRequest {
    pub delta: i64,
    /// Set by the order service; makes the adjustment an idempotent order
    /// decrement.
    #[serde(default)]
    pub order_id: Option<OrderId>,
}

#[derive(Debug, Deserialize)]
pub struct PlaceOrderRequest {
    pub product_name: String,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: OrderId,
    pub product_name: ProductName,
    pub quantity: i64,
    pub unit_price: u64,
    pub total_price: u64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            total_price: order.total_price(),
            id: order.id,
            product_name: order.product_name,
            quantity: order.quantity,
            unit_price: order.unit_price,
            status: order.status,
            created_at: order.created_at,
        }
    }
}
