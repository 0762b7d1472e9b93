use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use orderflow_core::OrderId;
use orderflow_orders::{Order, OrderStatus};

use super::StoreError;

/// Order persistence. Only the order service holds an `OrderStore`.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: &Order) -> Result<(), StoreError>;

    async fn get(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    /// All orders, oldest first.
    async fn list(&self) -> Result<Vec<Order>, StoreError>;

    /// Set `to` only if the order is currently `expected`.
    ///
    /// Returns the updated order, `NotFound`, or `StatusConflict` carrying the
    /// status that was actually found.
    async fn update_status(
        &self,
        id: OrderId,
        expected: OrderStatus,
        to: OrderStatus,
    ) -> Result<Order, StoreError>;
}

#[async_trait]
impl<S> OrderStore for Arc<S>
where
    S: OrderStore + ?Sized,
{
    async fn insert(&self, order: &Order) -> Result<(), StoreError> {
        (**self).insert(order).await
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        (**self).get(id).await
    }

    async fn list(&self) -> Result<Vec<Order>, StoreError> {
        (**self).list().await
    }

    async fn update_status(
        &self,
        id: OrderId,
        expected: OrderStatus,
        to: OrderStatus,
    ) -> Result<Order, StoreError> {
        (**self).update_status(id, expected, to).await
    }
}

/// In-memory order store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("order store lock poisoned".to_string())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().map_err(|_| Self::poisoned())?;
        if orders.contains_key(&order.id) {
            return Err(StoreError::AlreadyExists(order.id.to_string()));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let orders = self.orders.read().map_err(|_| Self::poisoned())?;
        Ok(orders.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Order>, StoreError> {
        let orders = self.orders.read().map_err(|_| Self::poisoned())?;
        let mut all: Vec<Order> = orders.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn update_status(
        &self,
        id: OrderId,
        expected: OrderStatus,
        to: OrderStatus,
    ) -> Result<Order, StoreError> {
        let mut orders = self.orders.write().map_err(|_| Self::poisoned())?;
        let order = orders.get_mut(&id).ok_or(StoreError::NotFound)?;
        if order.status != expected {
            return Err(StoreError::StatusConflict {
                expected,
                current: order.status,
            });
        }
        order.status = to;
        Ok(order.clone())
    }
}
