use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use orderflow_core::{OrderId, ProductName};
use orderflow_inventory::{Adjustment, NewProduct, Product, apply_delta};

use super::StoreError;

/// What the ledger remembers about an order decrement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LedgerOutcome {
    Applied,
    RejectedNotFound,
    RejectedUnderflow,
}

impl LedgerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOutcome::Applied => "applied",
            LedgerOutcome::RejectedNotFound => "rejected_not_found",
            LedgerOutcome::RejectedUnderflow => "rejected_underflow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(LedgerOutcome::Applied),
            "rejected_not_found" => Some(LedgerOutcome::RejectedNotFound),
            "rejected_underflow" => Some(LedgerOutcome::RejectedUnderflow),
            _ => None,
        }
    }
}

/// Result of an order-keyed decrement that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// First time this order was seen; carries the product after the decrement.
    Applied(Product),
    /// The order had already been applied. Nothing changed.
    AlreadyApplied,
}

/// Inventory persistence.
///
/// Only the inventory service holds an `InventoryStore`.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Insert a new product. A duplicate name is `AlreadyExists`.
    async fn create(&self, product: NewProduct) -> Result<Product, StoreError>;

    async fn get(&self, name: &ProductName) -> Result<Option<Product>, StoreError>;

    /// All products, ordered by name.
    async fn list(&self) -> Result<Vec<Product>, StoreError>;

    /// Atomically apply `adjustment` if the result stays non-negative.
    async fn adjust(
        &self,
        name: &ProductName,
        adjustment: Adjustment,
    ) -> Result<Product, StoreError>;

    /// Decrement `quantity` units for `order_id`, at most once per order.
    ///
    /// The ledger entry and the guarded decrement commit together. A rejection
    /// is recorded too, so a redelivered order gets the same answer
    /// (`NotFound` / `WouldUnderflow`) instead of a second attempt.
    async fn apply_order_decrement(
        &self,
        order_id: OrderId,
        name: &ProductName,
        quantity: i64,
    ) -> Result<DecrementOutcome, StoreError>;

    /// Remove a product, returning what was removed.
    async fn delete(&self, name: &ProductName) -> Result<Product, StoreError>;

    /// Forget ledger entries recorded before `before`, returning how many.
    ///
    /// An order decrement delivered again after its entry is gone is applied
    /// again, so retention has to outlast redelivery and outbox retries.
    async fn prune_ledger(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> InventoryStore for Arc<S>
where
    S: InventoryStore + ?Sized,
{
    async fn create(&self, product: NewProduct) -> Result<Product, StoreError> {
        (**self).create(product).await
    }

    async fn get(&self, name: &ProductName) -> Result<Option<Product>, StoreError> {
        (**self).get(name).await
    }

    async fn list(&self) -> Result<Vec<Product>, StoreError> {
        (**self).list().await
    }

    async fn adjust(
        &self,
        name: &ProductName,
        adjustment: Adjustment,
    ) -> Result<Product, StoreError> {
        (**self).adjust(name, adjustment).await
    }

    async fn apply_order_decrement(
        &self,
        order_id: OrderId,
        name: &ProductName,
        quantity: i64,
    ) -> Result<DecrementOutcome, StoreError> {
        (**self).apply_order_decrement(order_id, name, quantity).await
    }

    async fn delete(&self, name: &ProductName) -> Result<Product, StoreError> {
        (**self).delete(name).await
    }

    async fn prune_ledger(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).prune_ledger(before).await
    }
}

#[derive(Debug, Default)]
struct InventoryState {
    products: BTreeMap<ProductName, Product>,
    ledger: HashMap<OrderId, (LedgerOutcome, DateTime<Utc>)>,
}

/// In-memory inventory store.
///
/// Intended for tests/dev. One lock covers products and ledger, which is what
/// makes the guarded updates atomic.
#[derive(Debug, Default)]
pub struct InMemoryInventoryStore {
    state: RwLock<InventoryState>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, InventoryState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("inventory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, InventoryState>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("inventory store lock poisoned".to_string()))
    }
}

fn adjust_locked(
    state: &mut InventoryState,
    name: &ProductName,
    delta: i64,
) -> Result<Product, StoreError> {
    let product = state.products.get_mut(name).ok_or(StoreError::NotFound)?;
    product.quantity = apply_delta(product.quantity, delta)?;
    Ok(product.clone())
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn create(&self, product: NewProduct) -> Result<Product, StoreError> {
        let mut state = self.write()?;
        if state.products.contains_key(&product.name) {
            return Err(StoreError::AlreadyExists(product.name.to_string()));
        }
        let product = product.into_product();
        state.products.insert(product.name.clone(), product.clone());
        Ok(product)
    }

    async fn get(&self, name: &ProductName) -> Result<Option<Product>, StoreError> {
        Ok(self.read()?.products.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Product>, StoreError> {
        Ok(self.read()?.products.values().cloned().collect())
    }

    async fn adjust(
        &self,
        name: &ProductName,
        adjustment: Adjustment,
    ) -> Result<Product, StoreError> {
        let mut state = self.write()?;
        adjust_locked(&mut state, name, adjustment.delta())
    }

    async fn apply_order_decrement(
        &self,
        order_id: OrderId,
        name: &ProductName,
        quantity: i64,
    ) -> Result<DecrementOutcome, StoreError> {
        let adjustment = Adjustment::decrement(quantity)?;
        let mut state = self.write()?;

        if let Some((outcome, _)) = state.ledger.get(&order_id).copied() {
            return match outcome {
                LedgerOutcome::Applied => Ok(DecrementOutcome::AlreadyApplied),
                LedgerOutcome::RejectedNotFound => Err(StoreError::NotFound),
                LedgerOutcome::RejectedUnderflow => Err(StoreError::WouldUnderflow {
                    available: state.products.get(name).map(|p| p.quantity).unwrap_or(0),
                    delta: adjustment.delta(),
                }),
            };
        }

        let result = adjust_locked(&mut state, name, adjustment.delta());
        let outcome = match &result {
            Ok(_) => LedgerOutcome::Applied,
            Err(StoreError::NotFound) => LedgerOutcome::RejectedNotFound,
            Err(StoreError::WouldUnderflow { .. }) => LedgerOutcome::RejectedUnderflow,
            Err(_) => return result.map(DecrementOutcome::Applied),
        };
        state.ledger.insert(order_id, (outcome, Utc::now()));
        result.map(DecrementOutcome::Applied)
    }

    async fn delete(&self, name: &ProductName) -> Result<Product, StoreError> {
        self.write()?
            .products
            .remove(name)
            .ok_or(StoreError::NotFound)
    }

    async fn prune_ledger(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        let kept = state.ledger.len();
        state.ledger.retain(|_, (_, recorded_at)| *recorded_at >= before);
        Ok((kept - state.ledger.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget(qty: i64) -> NewProduct {
        NewProduct::new("widget", "a widget", 250, qty).unwrap()
    }

    fn name() -> ProductName {
        ProductName::parse("widget").unwrap()
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryInventoryStore::new();
        store.create(widget(10)).await.unwrap();
        let err = store.create(widget(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.get(&name()).await.unwrap().unwrap().quantity, 10);
    }

    #[tokio::test]
    async fn adjust_is_guarded_and_never_clamps() {
        let store = InMemoryInventoryStore::new();
        store.create(widget(5)).await.unwrap();

        let p = store.adjust(&name(), Adjustment::new(-5).unwrap()).await.unwrap();
        assert_eq!(p.quantity, 0);

        let err = store
            .adjust(&name(), Adjustment::new(-1).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::WouldUnderflow { available: 0, delta: -1 });
        assert_eq!(store.get(&name()).await.unwrap().unwrap().quantity, 0);
    }

    #[tokio::test]
    async fn adjust_missing_product_is_not_found() {
        let store = InMemoryInventoryStore::new();
        let err = store
            .adjust(&name(), Adjustment::new(3).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }

    #[tokio::test]
    async fn order_decrement_applies_once() {
        let store = InMemoryInventoryStore::new();
        store.create(widget(10)).await.unwrap();
        let order_id = OrderId::new();

        let first = store.apply_order_decrement(order_id, &name(), 4).await.unwrap();
        assert!(matches!(first, DecrementOutcome::Applied(ref p) if p.quantity == 6));

        let second = store.apply_order_decrement(order_id, &name(), 4).await.unwrap();
        assert_eq!(second, DecrementOutcome::AlreadyApplied);
        assert_eq!(store.get(&name()).await.unwrap().unwrap().quantity, 6);
    }

    #[tokio::test]
    async fn pruning_forgets_only_old_ledger_entries() {
        let store = InMemoryInventoryStore::new();
        store.create(widget(10)).await.unwrap();
        let order_id = OrderId::new();
        store.apply_order_decrement(order_id, &name(), 4).await.unwrap();

        let cutoff_in_past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.prune_ledger(cutoff_in_past).await.unwrap(), 0);
        assert_eq!(
            store.apply_order_decrement(order_id, &name(), 4).await.unwrap(),
            DecrementOutcome::AlreadyApplied
        );

        let cutoff_in_future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(store.prune_ledger(cutoff_in_future).await.unwrap(), 1);
        assert_eq!(store.prune_ledger(cutoff_in_future).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_decrement_stays_rejected_after_restock() {
        let store = InMemoryInventoryStore::new();
        store.create(widget(2)).await.unwrap();
        let order_id = OrderId::new();

        let err = store.apply_order_decrement(order_id, &name(), 3).await.unwrap_err();
        assert!(matches!(err, StoreError::WouldUnderflow { .. }));

        store.adjust(&name(), Adjustment::new(10).unwrap()).await.unwrap();
        let again = store.apply_order_decrement(order_id, &name(), 3).await.unwrap_err();
        assert!(matches!(again, StoreError::WouldUnderflow { .. }));
        assert_eq!(store.get(&name()).await.unwrap().unwrap().quantity, 12);
    }

    #[tokio::test]
    async fn concurrent_decrements_never_oversell() {
        let store = Arc::new(InMemoryInventoryStore::new());
        store.create(widget(10)).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.apply_order_decrement(OrderId::new(), &name(), 3).await
            }));
        }

        let mut accepted = 0;
        for t in tasks {
            if t.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 3);
        assert_eq!(store.get(&name()).await.unwrap().unwrap().quantity, 1);
    }

    #[tokio::test]
    async fn list_is_ordered_by_name() {
        let store = InMemoryInventoryStore::new();
        store.create(NewProduct::new("zeta", "", 1, 1).unwrap()).await.unwrap();
        store.create(NewProduct::new("alpha", "", 1, 1).unwrap()).await.unwrap();
        let names: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name.to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn delete_returns_removed_product() {
        let store = InMemoryInventoryStore::new();
        store.create(widget(1)).await.unwrap();
        assert_eq!(store.delete(&name()).await.unwrap().quantity, 1);
        assert_eq!(store.delete(&name()).await.unwrap_err(), StoreError::NotFound);
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn order_decrements_conserve_stock(
                initial in 0i64..50,
                orders in prop::collection::vec((1i64..15, any::<bool>()), 0..20),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    let store = InMemoryInventoryStore::new();
                    store.create(widget(initial)).await.unwrap();

                    let mut accepted = 0;
                    let mut placed = Vec::new();
                    for (qty, redeliver) in orders {
                        let order_id = OrderId::new();
                        if let Ok(DecrementOutcome::Applied(p)) =
                            store.apply_order_decrement(order_id, &name(), qty).await
                        {
                            accepted += qty;
                            prop_assert!(p.quantity >= 0);
                        }
                        placed.push((order_id, qty, redeliver));
                    }
                    for (order_id, qty, redeliver) in placed {
                        if redeliver {
                            let again = store.apply_order_decrement(order_id, &name(), qty).await;
                            prop_assert!(!matches!(again, Ok(DecrementOutcome::Applied(_))));
                        }
                    }

                    let remaining = store.get(&name()).await.unwrap().unwrap().quantity;
                    prop_assert!(accepted <= initial);
                    prop_assert_eq!(remaining, initial - accepted);
                    Ok(())
                })?;
            }
        }
    }
}
