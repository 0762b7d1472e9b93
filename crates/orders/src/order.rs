use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{DomainError, DomainResult, Entity, OrderId, ProductName};

use crate::placement::PlaceOrder;

/// Order status lifecycle: `pending` → `shipped` | `cancelled` (both terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Shipped,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "shipped" => Ok(OrderStatus::Shipped),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown order status '{other}' (expected pending, shipped or cancelled)"
            ))),
        }
    }
}

/// What a requested status change amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `pending` → the requested terminal status.
    Apply(OrderStatus),
    /// The order already has the requested status; nothing to do.
    Unchanged,
}

/// A placed order.
///
/// `unit_price` is a snapshot of the product price at placement time; later
/// price changes never touch it. Only `status` changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub product_name: ProductName,
    pub quantity: i64,
    pub unit_price: u64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Entity for Order {
    type Id = OrderId;
    const KIND: &'static str = "order";

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Order {
    /// New `pending` order for a verified request.
    pub fn place(request: &PlaceOrder, unit_price: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: OrderId::new(),
            product_name: request.product_name.clone(),
            quantity: request.quantity,
            unit_price,
            status: OrderStatus::Pending,
            created_at,
        }
    }

    /// Total price of the order at the captured unit price.
    pub fn total_price(&self) -> u64 {
        self.unit_price.saturating_mul(self.quantity.max(0) as u64)
    }

    /// Decide whether moving to `target` is allowed.
    ///
    /// A placed order can never be reset to `pending`, and a terminal order
    /// cannot move to a different terminal status. Re-requesting the current
    /// terminal status is a no-op.
    pub fn plan_transition(&self, target: OrderStatus) -> DomainResult<Transition> {
        if target == OrderStatus::Pending {
            return Err(DomainError::invalid_transition(format!(
                "order {} cannot be set back to pending",
                self.id
            )));
        }
        if self.status == target {
            return Ok(Transition::Unchanged);
        }
        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "order {} is already {}",
                self.id, self.status
            )));
        }
        Ok(Transition::Apply(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_order() -> Order {
        let req = PlaceOrder::new("widget", 4).unwrap();
        Order::place(&req, 250, Utc::now())
    }

    #[test]
    fn placed_order_is_pending_with_price_snapshot() {
        let order = pending_order();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.unit_price, 250);
        assert_eq!(order.total_price(), 1000);
    }

    #[test]
    fn pending_can_ship_or_cancel() {
        let order = pending_order();
        assert_eq!(
            order.plan_transition(OrderStatus::Shipped),
            Ok(Transition::Apply(OrderStatus::Shipped))
        );
        assert_eq!(
            order.plan_transition(OrderStatus::Cancelled),
            Ok(Transition::Apply(OrderStatus::Cancelled))
        );
    }

    #[test]
    fn nothing_goes_back_to_pending() {
        let mut order = pending_order();
        assert!(matches!(
            order.plan_transition(OrderStatus::Pending),
            Err(DomainError::InvalidTransition(_))
        ));

        order.status = OrderStatus::Shipped;
        assert!(matches!(
            order.plan_transition(OrderStatus::Pending),
            Err(DomainError::InvalidTransition(_))
        ));
    }

    #[test]
    fn terminal_statuses_are_final() {
        let mut order = pending_order();
        order.status = OrderStatus::Shipped;
        assert!(matches!(
            order.plan_transition(OrderStatus::Cancelled),
            Err(DomainError::InvalidTransition(_))
        ));
        assert_eq!(order.plan_transition(OrderStatus::Shipped), Ok(Transition::Unchanged));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Shipped".parse::<OrderStatus>(), Ok(OrderStatus::Shipped));
        assert_eq!("canceled".parse::<OrderStatus>(), Ok(OrderStatus::Cancelled));
        assert!("lost".parse::<OrderStatus>().is_err());
    }
}
