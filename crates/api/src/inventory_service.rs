//! Inventory service: product registry, guarded adjustments, and the consumer
//! that applies order decrements delivered over the bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use orderflow_core::{OrderId, ProductName};
use orderflow_events::{BusError, Event, EventBus, EventHandler, HandlerError, RawEnvelope};
use orderflow_infra::{CacheKey, DecrementOutcome, InventoryStore, ReadThroughCache, StoreError};
use orderflow_inventory::{Adjustment, InventoryEvent, NewProduct, Product, RejectionReason};
use orderflow_orders::OrderEvent;

use crate::app::errors::ServiceError;

/// Consumer group of the inventory service on every topic.
pub const CONSUMER_GROUP: &str = "inventory-service";

pub struct InventoryService {
    store: Arc<dyn InventoryStore>,
    cache: ReadThroughCache,
    bus: Arc<dyn EventBus>,
}

impl InventoryService {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        cache: ReadThroughCache,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self { store, cache, bus }
    }

    #[instrument(skip(self, product), fields(product = %product.name))]
    pub async fn create_product(&self, product: NewProduct) -> Result<Product, ServiceError> {
        let created = self.store.create(product).await.map_err(|e| match e {
            StoreError::AlreadyExists(name) => {
                ServiceError::conflict(format!("product '{name}' already exists"))
            }
            other => other.into(),
        })?;
        self.invalidate(&created.name).await;
        info!(product = %created.name, quantity = created.quantity, "product created");

        self.publish(InventoryEvent::ProductCreated {
            product: created.clone(),
        })
        .await;
        Ok(created)
    }

    pub async fn get_product(&self, name: &ProductName) -> Result<Product, ServiceError> {
        let key = CacheKey::entity::<Product>(name);
        self.cache
            .read_through(&key, || self.store.get(name))
            .await?
            .ok_or_else(|| product_not_found(name))
    }

    pub async fn list_products(&self) -> Result<Vec<Product>, ServiceError> {
        let key = CacheKey::collection::<Product>();
        let products = self
            .cache
            .read_through(&key, || async { self.store.list().await.map(Some) })
            .await?;
        Ok(products.unwrap_or_default())
    }

    /// Apply `delta` to `name`'s quantity.
    ///
    /// With an `order_id` the adjustment is an order decrement and is applied
    /// at most once per order; a repeat returns the current product.
    #[instrument(skip(self), fields(product = %name))]
    pub async fn adjust_inventory(
        &self,
        name: &ProductName,
        delta: i64,
        order_id: Option<OrderId>,
    ) -> Result<Product, ServiceError> {
        let Some(order_id) = order_id else {
            let adjustment = Adjustment::new(delta)?;
            let product = self
                .store
                .adjust(name, adjustment)
                .await
                .map_err(|e| adjust_error(name, e))?;
            self.after_adjust(&product, delta, None).await;
            return Ok(product);
        };

        if delta >= 0 {
            return Err(ServiceError::validation(
                "an order adjustment must be a negative delta",
            ));
        }
        let quantity = delta
            .checked_neg()
            .ok_or_else(|| ServiceError::validation("delta is out of range"))?;
        match self
            .store
            .apply_order_decrement(order_id, name, quantity)
            .await
            .map_err(|e| adjust_error(name, e))?
        {
            DecrementOutcome::Applied(product) => {
                self.after_adjust(&product, delta, Some(order_id)).await;
                Ok(product)
            }
            DecrementOutcome::AlreadyApplied => {
                info!(order_id = %order_id, "order decrement already applied");
                self.store
                    .get(name)
                    .await?
                    .ok_or_else(|| product_not_found(name))
            }
        }
    }

    #[instrument(skip(self), fields(product = %name))]
    pub async fn delete_product(&self, name: &ProductName) -> Result<Product, ServiceError> {
        let deleted = self.store.delete(name).await.map_err(|e| match e {
            StoreError::NotFound => product_not_found(name),
            other => other.into(),
        })?;
        self.invalidate(name).await;
        info!(product = %name, "product deleted");

        self.publish(InventoryEvent::ProductDeleted { name: name.clone() })
            .await;
        Ok(deleted)
    }

    /// Apply one order's decrement on behalf of the order-event consumer.
    ///
    /// A definitive rejection is answered with `AdjustmentRejected`; that
    /// publication has to succeed, otherwise the delivery is retried.
    #[instrument(skip(self), fields(order_id = %order_id, product = %name))]
    pub async fn apply_order(
        &self,
        order_id: OrderId,
        name: &ProductName,
        quantity: i64,
    ) -> Result<(), HandlerError> {
        let reason = match self.store.apply_order_decrement(order_id, name, quantity).await {
            Ok(DecrementOutcome::Applied(product)) => {
                self.after_adjust(&product, -quantity, Some(order_id)).await;
                return Ok(());
            }
            Ok(DecrementOutcome::AlreadyApplied) => return Ok(()),
            Err(StoreError::NotFound) => RejectionReason::ProductNotFound,
            Err(StoreError::WouldUnderflow { .. }) => RejectionReason::InsufficientInventory,
            Err(e) if e.is_transient() => return Err(HandlerError::retry(e.to_string())),
            Err(e) => return Err(HandlerError::discard(e.to_string())),
        };

        warn!(order_id = %order_id, product = %name, ?reason, "order decrement rejected");
        let rejection = InventoryEvent::AdjustmentRejected {
            order_id,
            name: name.clone(),
            quantity,
            reason,
        };
        self.try_publish(rejection)
            .await
            .map_err(|e| HandlerError::retry(e.to_string()))
    }

    /// Drop ledger entries older than `retention`.
    pub async fn prune_ledger(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64, StoreError> {
        let Some(before) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        let pruned = self.store.prune_ledger(before).await?;
        if pruned > 0 {
            info!(pruned, %before, "order ledger pruned");
        }
        Ok(pruned)
    }

    async fn after_adjust(&self, product: &Product, delta: i64, order_id: Option<OrderId>) {
        self.invalidate(&product.name).await;
        info!(
            product = %product.name,
            delta,
            quantity = product.quantity,
            order_id = order_id.map(|id| id.to_string()),
            "inventory adjusted"
        );
        self.publish(InventoryEvent::InventoryAdjusted {
            name: product.name.clone(),
            delta,
            quantity: product.quantity,
            order_id,
        })
        .await;
    }

    async fn invalidate(&self, name: &ProductName) {
        self.cache
            .invalidate(&CacheKey::entity_and_collection::<Product>(name))
            .await;
    }

    async fn try_publish(&self, event: InventoryEvent) -> Result<(), BusError> {
        let envelope = RawEnvelope::wrap(event)?;
        self.bus.publish(envelope).await
    }

    /// Publish after a committed mutation. Failures are logged, never undo it.
    async fn publish(&self, event: InventoryEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.try_publish(event).await {
            warn!(event_type, error = %e, "publishing inventory event failed");
        }
    }
}

fn product_not_found(name: &ProductName) -> ServiceError {
    ServiceError::not_found(format!("product '{name}' not found"))
}

fn adjust_error(name: &ProductName, err: StoreError) -> ServiceError {
    match err {
        StoreError::NotFound => product_not_found(name),
        StoreError::Invalid(msg) => ServiceError::Validation(msg),
        other => other.into(),
    }
}

/// Consumes the `orders` topic: every `OrderCreated` becomes an idempotent
/// decrement. Status changes are not the inventory service's concern.
pub struct OrderEventHandler {
    service: Arc<InventoryService>,
}

impl OrderEventHandler {
    pub fn new(service: Arc<InventoryService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for OrderEventHandler {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        let event: OrderEvent = envelope.decode().map_err(|e| {
            HandlerError::discard(format!("undecodable {} payload: {e}", envelope.event_type()))
        })?;

        match event {
            OrderEvent::OrderCreated {
                order_id,
                product_name,
                quantity,
                ..
            } => self.service.apply_order(order_id, &product_name, quantity).await,
            OrderEvent::OrderStatusChanged { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use orderflow_events::{InMemoryEventBus, Topic};
    use tokio::sync::oneshot;
    use orderflow_infra::{InMemoryCache, InMemoryInventoryStore};

    use super::*;

    fn service() -> (Arc<InventoryService>, Arc<InMemoryEventBus>) {
        let bus = Arc::new(InMemoryEventBus::new());
        let cache = ReadThroughCache::new(
            Arc::new(InMemoryCache::new()),
            std::time::Duration::from_secs(60),
        );
        let service = InventoryService::new(Arc::new(InMemoryInventoryStore::new()), cache, bus.clone());
        (Arc::new(service), bus)
    }

    fn widget() -> ProductName {
        ProductName::parse("widget").unwrap()
    }

    async fn seed(service: &InventoryService, qty: i64) {
        service
            .create_product(NewProduct::new("widget", "a widget", 250, qty).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reads_reflect_the_latest_write() {
        let (service, _) = service();
        seed(&service, 10).await;

        assert_eq!(service.get_product(&widget()).await.unwrap().quantity, 10);
        assert_eq!(service.list_products().await.unwrap()[0].quantity, 10);

        service.adjust_inventory(&widget(), -4, None).await.unwrap();
        assert_eq!(service.get_product(&widget()).await.unwrap().quantity, 6);
        assert_eq!(service.list_products().await.unwrap()[0].quantity, 6);

        service.delete_product(&widget()).await.unwrap();
        assert!(matches!(
            service.get_product(&widget()).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(service.list_products().await.unwrap().is_empty());
    }

    /// Store whose next `get` parks after reading, until released.
    struct ParkedGet {
        inner: InMemoryInventoryStore,
        park: std::sync::Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    }

    #[async_trait]
    impl InventoryStore for ParkedGet {
        async fn create(&self, product: NewProduct) -> Result<Product, StoreError> {
            self.inner.create(product).await
        }

        async fn get(&self, name: &ProductName) -> Result<Option<Product>, StoreError> {
            let found = self.inner.get(name).await?;
            let parked = self.park.lock().unwrap().take();
            if let Some((loaded, resume)) = parked {
                let _ = loaded.send(());
                let _ = resume.await;
            }
            Ok(found)
        }

        async fn list(&self) -> Result<Vec<Product>, StoreError> {
            self.inner.list().await
        }

        async fn adjust(&self, name: &ProductName, adjustment: Adjustment) -> Result<Product, StoreError> {
            self.inner.adjust(name, adjustment).await
        }

        async fn apply_order_decrement(
            &self,
            order_id: OrderId,
            name: &ProductName,
            quantity: i64,
        ) -> Result<DecrementOutcome, StoreError> {
            self.inner.apply_order_decrement(order_id, name, quantity).await
        }

        async fn delete(&self, name: &ProductName) -> Result<Product, StoreError> {
            self.inner.delete(name).await
        }

        async fn prune_ledger(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.prune_ledger(before).await
        }
    }

    #[tokio::test]
    async fn slow_read_does_not_resurrect_an_adjusted_quantity() {
        let (loaded_tx, loaded_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        let store = Arc::new(ParkedGet {
            inner: InMemoryInventoryStore::new(),
            park: std::sync::Mutex::new(None),
        });
        let cache = ReadThroughCache::new(
            Arc::new(InMemoryCache::new()),
            std::time::Duration::from_secs(60),
        );
        let service = Arc::new(InventoryService::new(
            store.clone(),
            cache,
            Arc::new(InMemoryEventBus::new()),
        ));
        seed(&service, 10).await;
        *store.park.lock().unwrap() = Some((loaded_tx, resume_rx));

        let reader = tokio::spawn({
            let service = service.clone();
            async move { service.get_product(&widget()).await }
        });
        loaded_rx.await.unwrap();

        let adjusted = service.adjust_inventory(&widget(), -4, None).await.unwrap();
        assert_eq!(adjusted.quantity, 6);
        resume_tx.send(()).unwrap();
        assert_eq!(reader.await.unwrap().unwrap().quantity, 10);

        assert_eq!(service.get_product(&widget()).await.unwrap().quantity, 6);
    }

    #[tokio::test]
    async fn duplicate_product_is_a_conflict() {
        let (service, _) = service();
        seed(&service, 1).await;
        let err = service
            .create_product(NewProduct::new("widget", "", 1, 1).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn underflow_is_a_conflict_and_changes_nothing() {
        let (service, _) = service();
        seed(&service, 3).await;
        let err = service.adjust_inventory(&widget(), -4, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(service.get_product(&widget()).await.unwrap().quantity, 3);
    }

    #[tokio::test]
    async fn zero_delta_is_invalid() {
        let (service, _) = service();
        seed(&service, 3).await;
        let err = service.adjust_inventory(&widget(), 0, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn extreme_deltas_are_refused_without_changes() {
        let (service, _) = service();
        seed(&service, 10).await;

        let err = service
            .adjust_inventory(&widget(), i64::MIN, Some(OrderId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = service.adjust_inventory(&widget(), i64::MIN, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        let err = service.adjust_inventory(&widget(), i64::MAX, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        assert_eq!(service.get_product(&widget()).await.unwrap().quantity, 10);
    }

    #[tokio::test]
    async fn order_keyed_adjustment_is_idempotent() {
        let (service, bus) = service();
        seed(&service, 10).await;
        let order_id = OrderId::new();

        let first = service.adjust_inventory(&widget(), -4, Some(order_id)).await.unwrap();
        let second = service.adjust_inventory(&widget(), -4, Some(order_id)).await.unwrap();
        assert_eq!(first.quantity, 6);
        assert_eq!(second.quantity, 6);

        let adjusted: Vec<_> = bus
            .published(Topic::Inventory)
            .into_iter()
            .filter(|e| e.event_type() == "inventory.product.adjusted")
            .collect();
        assert_eq!(adjusted.len(), 1);
    }

    #[tokio::test]
    async fn ledger_entries_expire_after_retention() {
        let (service, _) = service();
        seed(&service, 10).await;
        service
            .adjust_inventory(&widget(), -2, Some(OrderId::new()))
            .await
            .unwrap();
        let day = Duration::from_secs(24 * 3600);

        assert_eq!(service.prune_ledger(chrono::Utc::now(), day).await.unwrap(), 0);
        let next_week = chrono::Utc::now() + chrono::Duration::days(7);
        assert_eq!(service.prune_ledger(next_week, day).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn redelivered_order_created_decrements_once() {
        let (service, _) = service();
        seed(&service, 10).await;
        let handler = OrderEventHandler::new(service.clone());

        let envelope = RawEnvelope::wrap(OrderEvent::OrderCreated {
            order_id: OrderId::new(),
            product_name: widget(),
            quantity: 4,
            unit_price: 250,
            created_at: chrono::Utc::now(),
        })
        .unwrap();

        handler.handle(&envelope).await.unwrap();
        handler.handle(&envelope).await.unwrap();
        assert_eq!(service.get_product(&widget()).await.unwrap().quantity, 6);
    }

    #[tokio::test]
    async fn rejected_order_publishes_rejection() {
        let (service, bus) = service();
        seed(&service, 2).await;
        let handler = OrderEventHandler::new(service.clone());
        let order_id = OrderId::new();

        let envelope = RawEnvelope::wrap(OrderEvent::OrderCreated {
            order_id,
            product_name: widget(),
            quantity: 5,
            unit_price: 250,
            created_at: chrono::Utc::now(),
        })
        .unwrap();
        handler.handle(&envelope).await.unwrap();

        let rejection = bus
            .published(Topic::Inventory)
            .into_iter()
            .find(|e| e.event_type() == "inventory.adjustment.rejected")
            .expect("rejection published");
        let event: InventoryEvent = rejection.decode().unwrap();
        assert_eq!(
            event,
            InventoryEvent::AdjustmentRejected {
                order_id,
                name: widget(),
                quantity: 5,
                reason: RejectionReason::InsufficientInventory,
            }
        );
        assert_eq!(service.get_product(&widget()).await.unwrap().quantity, 2);
    }

    #[tokio::test]
    async fn garbage_payload_is_discarded() {
        let (service, _) = service();
        let handler = OrderEventHandler::new(service);
        let envelope = RawEnvelope::wrap(OrderEvent::OrderStatusChanged {
            order_id: OrderId::new(),
            product_name: widget(),
            status: orderflow_orders::OrderStatus::Shipped,
        })
        .unwrap();
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["payload"]["type"] = serde_json::json!("order_teleported");
        let bad: RawEnvelope = serde_json::from_value(value).unwrap();

        let err = handler.handle(&bad).await.unwrap_err();
        assert!(err.should_ack());
    }
}
