//! Order service: the placement workflow, status updates, compensation of
//! rejected orders, and the outbox relay that finishes interrupted work.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use orderflow_core::OrderId;
use orderflow_events::{EventBus, EventHandler, HandlerError, RawEnvelope};
use orderflow_infra::{
    CacheKey, OrderStore, OutboxStore, OutboxTask, ReadThroughCache, StoreError,
};
use orderflow_inventory::{InventoryEvent, RejectionReason};
use orderflow_orders::{
    Order, OrderEvent, OrderStatus, PlaceOrder, PlacementStage, Transition, verify_availability,
};

use crate::adjuster::{AdjustOutcome, InventoryAdjuster};
use crate::app::errors::ServiceError;
use crate::inventory_client::{InventoryClient, InventoryClientError};
use crate::publisher::OutboxPublisher;

/// Consumer group of the order service on every topic.
pub const CONSUMER_GROUP: &str = "order-service";

const OUTBOX_BATCH: usize = 32;
/// How long a claimed outbox record stays invisible to other relays.
const OUTBOX_LEASE_SECS: i64 = 30;
const RETRY_BASE_MS: i64 = 500;
const RETRY_MAX_MS: i64 = 60_000;

/// Counts from one outbox relay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainResult {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub abandoned: usize,
}

pub struct OrderService {
    orders: Arc<dyn OrderStore>,
    outbox: Arc<dyn OutboxStore>,
    inventory: Arc<dyn InventoryClient>,
    adjuster: Arc<dyn InventoryAdjuster>,
    publisher: Arc<OutboxPublisher>,
    bus: Arc<dyn EventBus>,
    cache: ReadThroughCache,
    max_outbox_attempts: u32,
}

impl OrderService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        outbox: Arc<dyn OutboxStore>,
        inventory: Arc<dyn InventoryClient>,
        adjuster: Arc<dyn InventoryAdjuster>,
        bus: Arc<dyn EventBus>,
        cache: ReadThroughCache,
    ) -> Self {
        let publisher = Arc::new(OutboxPublisher::new(bus.clone(), outbox.clone()));
        Self {
            orders,
            outbox,
            inventory,
            adjuster,
            publisher,
            bus,
            cache,
            max_outbox_attempts: 20,
        }
    }

    /// Give up on an outbox record after this many failed attempts.
    pub fn with_max_outbox_attempts(mut self, max: u32) -> Self {
        self.max_outbox_attempts = max.max(1);
        self
    }

    /// Run the placement workflow for one request.
    ///
    /// Failures before `Persisted` leave nothing behind. After it, a definitive
    /// inventory refusal cancels the order and a transient failure leaves it
    /// `pending` with an outbox record to finish the adjustment.
    #[instrument(
        skip(self, request),
        fields(product = %request.product_name, quantity = request.quantity, strategy = self.adjuster.strategy())
    )]
    pub async fn place_order(&self, request: PlaceOrder) -> Result<Order, ServiceError> {
        debug!(stage = %PlacementStage::Received, "order received");

        let product = self
            .inventory
            .get_product(&request.product_name)
            .await
            .map_err(|e| match e {
                InventoryClientError::NotFound => {
                    ServiceError::not_found(format!("product '{}' not found", request.product_name))
                }
                InventoryClientError::Insufficient(msg) => ServiceError::conflict(msg),
                other => ServiceError::unavailable(other.to_string()),
            })?;
        verify_availability(request.quantity, product.quantity)?;
        debug!(stage = %PlacementStage::InventoryVerified, available = product.quantity, "inventory verified");

        let order = Order::place(&request, product.price, Utc::now());
        self.orders.insert(&order).await?;
        self.cache.invalidate(&[CacheKey::collection::<Order>()]).await;
        info!(order_id = %order.id, stage = %PlacementStage::Persisted, "order persisted");

        match self.adjuster.adjust(&order).await {
            AdjustOutcome::Applied => {
                debug!(order_id = %order.id, stage = %PlacementStage::InventoryAdjusted, "inventory adjusted");
                self.notify(OrderEvent::created(&order)).await;
            }
            AdjustOutcome::Deferred => {
                debug!(order_id = %order.id, "inventory adjustment handed to consumer");
            }
            AdjustOutcome::Rejected(reason) => {
                self.compensate_or_requeue(&order, reason).await;
                return Err(rejection_error(&order, reason));
            }
            AdjustOutcome::Unavailable(msg) => {
                warn!(order_id = %order.id, error = %msg, "inventory adjustment deferred to outbox");
                self.enqueue_adjustment(&order).await;
                return Err(ServiceError::DependencyUnavailable {
                    message: format!(
                        "order {} is recorded but its inventory adjustment is still pending: {msg}",
                        order.id
                    ),
                    order_id: Some(order.id),
                });
            }
        }

        info!(order_id = %order.id, stage = %PlacementStage::Completed, total = order.total_price(), "order placed");
        Ok(order)
    }

    pub async fn get_order(&self, id: OrderId) -> Result<Order, ServiceError> {
        let key = CacheKey::entity::<Order>(&id);
        self.cache
            .read_through(&key, || self.orders.get(id))
            .await?
            .ok_or_else(|| order_not_found(id))
    }

    pub async fn list_orders(&self) -> Result<Vec<Order>, ServiceError> {
        let key = CacheKey::collection::<Order>();
        let orders = self
            .cache
            .read_through(&key, || async { self.orders.list().await.map(Some) })
            .await?;
        Ok(orders.unwrap_or_default())
    }

    /// Move an order out of `pending`. Re-requesting the current status is a
    /// no-op that returns the order unchanged and publishes nothing.
    #[instrument(skip(self), fields(order_id = %id))]
    pub async fn update_status(&self, id: OrderId, status: &str) -> Result<Order, ServiceError> {
        let target: OrderStatus = status.parse()?;
        let order = self.orders.get(id).await?.ok_or_else(|| order_not_found(id))?;

        let to = match order.plan_transition(target)? {
            Transition::Unchanged => return Ok(order),
            Transition::Apply(to) => to,
        };

        let updated = match self.orders.update_status(id, OrderStatus::Pending, to).await {
            Ok(updated) => updated,
            Err(StoreError::StatusConflict { current, .. }) => {
                // Lost a race with another update; judge against what won.
                let current = Order { status: current, ..order };
                return match current.plan_transition(target)? {
                    Transition::Unchanged => Ok(current),
                    Transition::Apply(_) => Err(ServiceError::InvalidTransition(format!(
                        "order {id} is already {}",
                        current.status
                    ))),
                };
            }
            Err(StoreError::NotFound) => return Err(order_not_found(id)),
            Err(e) => return Err(e.into()),
        };

        self.invalidate(id).await;
        info!(order_id = %id, status = %updated.status, "order status updated");
        self.notify(OrderEvent::status_changed(&updated)).await;
        Ok(updated)
    }

    /// Cancel a still-`pending` order whose inventory decrement was refused.
    ///
    /// Repeating it is harmless. An order that already shipped is left alone
    /// and reported.
    #[instrument(skip(self), fields(order_id = %id))]
    pub async fn compensate(&self, id: OrderId, reason: RejectionReason) -> Result<(), StoreError> {
        match self
            .orders
            .update_status(id, OrderStatus::Pending, OrderStatus::Cancelled)
            .await
        {
            Ok(order) => {
                self.invalidate(id).await;
                warn!(order_id = %id, ?reason, "order cancelled, inventory adjustment rejected");
                self.notify(OrderEvent::status_changed(&order)).await;
                Ok(())
            }
            Err(StoreError::StatusConflict {
                current: OrderStatus::Cancelled,
                ..
            }) => Ok(()),
            Err(StoreError::StatusConflict { current, .. }) => {
                error!(order_id = %id, status = %current, ?reason, "inventory rejected an order that is no longer pending");
                Ok(())
            }
            Err(StoreError::NotFound) => {
                warn!(order_id = %id, "rejection for unknown order");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One relay pass over the outbox records due at `now`. Records are leased
    /// while this pass works on them.
    pub async fn relay_outbox(&self, now: DateTime<Utc>) -> Result<DrainResult, StoreError> {
        let due = self
            .outbox
            .claim(now, OUTBOX_BATCH, chrono::Duration::seconds(OUTBOX_LEASE_SECS))
            .await?;
        let mut result = DrainResult {
            claimed: due.len(),
            ..DrainResult::default()
        };

        for record in due {
            let attempt = match &record.task {
                OutboxTask::Publish { envelope } => self
                    .bus
                    .publish(envelope.clone())
                    .await
                    .map_err(|e| e.to_string()),
                OutboxTask::AdjustInventory { order_id, .. } => self.retry_adjustment(*order_id).await,
            };

            match attempt {
                Ok(()) => {
                    self.outbox.complete(record.id).await?;
                    result.completed += 1;
                }
                Err(msg) if record.attempts + 1 >= self.max_outbox_attempts => {
                    error!(
                        outbox_id = %record.id,
                        kind = record.task.kind(),
                        attempts = record.attempts + 1,
                        error = %msg,
                        "outbox record abandoned"
                    );
                    self.outbox.abandon(record.id, &msg).await?;
                    result.abandoned += 1;
                }
                Err(msg) => {
                    let next = now + retry_delay(record.attempts + 1);
                    debug!(outbox_id = %record.id, kind = record.task.kind(), error = %msg, "outbox attempt failed");
                    self.outbox.record_failure(record.id, &msg, next).await?;
                    result.retried += 1;
                }
            }
        }

        if result.claimed > 0 {
            info!(?result, "outbox relay pass");
        }
        Ok(result)
    }

    async fn retry_adjustment(&self, id: OrderId) -> Result<(), String> {
        let order = match self.orders.get(id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!(order_id = %id, "queued adjustment for unknown order dropped");
                return Ok(());
            }
            Err(e) => return Err(e.to_string()),
        };
        // A shipped order still owes its decrement; only a cancelled one is released.
        if order.status == OrderStatus::Cancelled {
            debug!(order_id = %id, "queued adjustment for cancelled order dropped");
            return Ok(());
        }

        match self.adjuster.adjust(&order).await {
            AdjustOutcome::Applied => {
                info!(order_id = %id, "queued inventory adjustment applied");
                self.publisher
                    .publish(OrderEvent::created(&order))
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            AdjustOutcome::Deferred => Ok(()),
            AdjustOutcome::Rejected(reason) => {
                self.compensate(id, reason).await.map_err(|e| e.to_string())
            }
            AdjustOutcome::Unavailable(msg) => Err(msg),
        }
    }

    async fn compensate_or_requeue(&self, order: &Order, reason: RejectionReason) {
        if let Err(e) = self.compensate(order.id, reason).await {
            warn!(order_id = %order.id, error = %e, "compensation failed, queueing retry");
            self.enqueue_adjustment(order).await;
        }
    }

    async fn enqueue_adjustment(&self, order: &Order) {
        let task = OutboxTask::AdjustInventory {
            order_id: order.id,
            product_name: order.product_name.clone(),
            quantity: order.quantity,
        };
        if let Err(e) = self.outbox.enqueue(task).await {
            error!(order_id = %order.id, error = %e, "could not queue inventory adjustment");
        }
    }

    async fn invalidate(&self, id: OrderId) {
        self.cache
            .invalidate(&CacheKey::entity_and_collection::<Order>(&id))
            .await;
    }

    async fn notify(&self, event: OrderEvent) {
        let order_id = event.order_id();
        if let Err(e) = self.publisher.publish(event).await {
            error!(order_id = %order_id, error = %e, "order event lost, outbox unavailable");
        }
    }
}

fn order_not_found(id: OrderId) -> ServiceError {
    ServiceError::not_found(format!("order {id} not found"))
}

fn rejection_error(order: &Order, reason: RejectionReason) -> ServiceError {
    match reason {
        RejectionReason::ProductNotFound => {
            ServiceError::not_found(format!("product '{}' not found", order.product_name))
        }
        RejectionReason::InsufficientInventory => ServiceError::conflict(format!(
            "insufficient inventory for '{}' (requested: {})",
            order.product_name, order.quantity
        )),
    }
}

fn retry_delay(attempts: u32) -> chrono::Duration {
    let exp = attempts.saturating_sub(1).min(10);
    chrono::Duration::milliseconds((RETRY_BASE_MS << exp).min(RETRY_MAX_MS))
}

/// Consumes the `inventory` topic and cancels orders whose decrement the
/// inventory service rejected.
pub struct InventoryEventHandler {
    service: Arc<OrderService>,
}

impl InventoryEventHandler {
    pub fn new(service: Arc<OrderService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for InventoryEventHandler {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        let event: InventoryEvent = envelope.decode().map_err(|e| {
            HandlerError::discard(format!("undecodable {} payload: {e}", envelope.event_type()))
        })?;

        let InventoryEvent::AdjustmentRejected { order_id, reason, .. } = event else {
            return Ok(());
        };
        self.service
            .compensate(order_id, reason)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    HandlerError::retry(e.to_string())
                } else {
                    HandlerError::discard(e.to_string())
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use orderflow_core::ProductName;
    use orderflow_events::{InMemoryEventBus, Topic};
    use orderflow_infra::{InMemoryCache, InMemoryInventoryStore, InMemoryOrderStore, InMemoryOutbox};
    use orderflow_inventory::{NewProduct, Product};

    use super::*;
    use crate::adjuster::{DirectAdjuster, EventDrivenAdjuster};
    use crate::inventory_service::InventoryService;

    /// In-process stand-in for the inventory service's HTTP API.
    struct LocalInventory {
        service: Arc<InventoryService>,
        decrement_down: AtomicBool,
        advertised: Option<i64>,
    }

    #[async_trait]
    impl InventoryClient for LocalInventory {
        async fn get_product(&self, name: &ProductName) -> Result<Product, InventoryClientError> {
            let mut product = self.service.get_product(name).await.map_err(to_client)?;
            if let Some(quantity) = self.advertised {
                product.quantity = quantity;
            }
            Ok(product)
        }

        async fn apply_order_decrement(
            &self,
            order_id: OrderId,
            name: &ProductName,
            quantity: i64,
        ) -> Result<Product, InventoryClientError> {
            if self.decrement_down.load(Ordering::SeqCst) {
                return Err(InventoryClientError::Timeout(Duration::from_secs(2)));
            }
            self.service
                .adjust_inventory(name, -quantity, Some(order_id))
                .await
                .map_err(to_client)
        }
    }

    fn to_client(err: ServiceError) -> InventoryClientError {
        match err {
            ServiceError::NotFound(_) => InventoryClientError::NotFound,
            ServiceError::Conflict(msg) => InventoryClientError::Insufficient(msg),
            other => InventoryClientError::Unavailable(other.to_string()),
        }
    }

    struct Harness {
        inventory: Arc<InventoryService>,
        client: Arc<LocalInventory>,
        orders: Arc<OrderService>,
        bus: Arc<InMemoryEventBus>,
        outbox: Arc<InMemoryOutbox>,
    }

    fn cache() -> ReadThroughCache {
        ReadThroughCache::new(Arc::new(InMemoryCache::new()), Duration::from_secs(60))
    }

    async fn harness(event_mode: bool, advertised: Option<i64>) -> Harness {
        let bus = Arc::new(InMemoryEventBus::new());
        let inventory = Arc::new(InventoryService::new(
            Arc::new(InMemoryInventoryStore::new()),
            cache(),
            bus.clone(),
        ));
        inventory
            .create_product(NewProduct::new("widget", "a widget", 250, 10).unwrap())
            .await
            .unwrap();

        let client = Arc::new(LocalInventory {
            service: inventory.clone(),
            decrement_down: AtomicBool::new(false),
            advertised,
        });
        let outbox = Arc::new(InMemoryOutbox::new());
        let adjuster: Arc<dyn InventoryAdjuster> = if event_mode {
            Arc::new(EventDrivenAdjuster::new(Arc::new(OutboxPublisher::new(
                bus.clone(),
                outbox.clone(),
            ))))
        } else {
            Arc::new(DirectAdjuster::new(client.clone()))
        };
        let orders = Arc::new(
            OrderService::new(
                Arc::new(InMemoryOrderStore::new()),
                outbox.clone(),
                client.clone(),
                adjuster,
                bus.clone(),
                cache(),
            )
            .with_max_outbox_attempts(3),
        );
        Harness {
            inventory,
            client,
            orders,
            bus,
            outbox,
        }
    }

    fn widget() -> ProductName {
        ProductName::parse("widget").unwrap()
    }

    async fn stock(h: &Harness) -> i64 {
        h.inventory.get_product(&widget()).await.unwrap().quantity
    }

    fn order_events(h: &Harness, event_type: &str) -> usize {
        h.bus
            .published(Topic::Orders)
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    #[tokio::test]
    async fn accepted_then_oversized_order() {
        let h = harness(false, None).await;

        let order = h.orders.place_order(PlaceOrder::new("widget", 4).unwrap()).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.unit_price, 250);
        assert_eq!(stock(&h).await, 6);
        assert_eq!(order_events(&h, "order.created"), 1);

        let err = h
            .orders
            .place_order(PlaceOrder::new("widget", 7).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(stock(&h).await, 6);
        assert_eq!(h.orders.list_orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_product_leaves_no_order() {
        let h = harness(false, None).await;
        let err = h
            .orders
            .place_order(PlaceOrder::new("gadget", 1).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(h.orders.list_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lost_race_is_compensated() {
        // Verification sees plenty of stock, the guarded decrement does not.
        let h = harness(false, Some(100)).await;

        let err = h
            .orders
            .place_order(PlaceOrder::new("widget", 20).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(stock(&h).await, 10);

        let orders = h.orders.list_orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Cancelled);
        assert_eq!(order_events(&h, "order.created"), 0);
        assert_eq!(order_events(&h, "order.status_changed"), 1);
    }

    #[tokio::test]
    async fn concurrent_orders_never_oversell() {
        let h = harness(false, None).await;
        let a = h.orders.place_order(PlaceOrder::new("widget", 6).unwrap());
        let b = h.orders.place_order(PlaceOrder::new("widget", 6).unwrap());
        let (a, b) = tokio::join!(a, b);

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let failed = a.err().or(b.err()).unwrap();
        assert!(matches!(failed, ServiceError::Conflict(_)));
        assert_eq!(stock(&h).await, 4);
    }

    #[tokio::test]
    async fn unavailable_inventory_is_finished_by_the_relay() {
        let h = harness(false, None).await;
        h.client.decrement_down.store(true, Ordering::SeqCst);

        let err = h
            .orders
            .place_order(PlaceOrder::new("widget", 3).unwrap())
            .await
            .unwrap_err();
        let ServiceError::DependencyUnavailable { order_id: Some(id), .. } = err else {
            panic!("expected 503 with order id, got {err:?}");
        };
        assert_eq!(h.orders.get_order(id).await.unwrap().status, OrderStatus::Pending);
        assert_eq!(stock(&h).await, 10);

        // Still down: the attempt is counted and rescheduled.
        let pass = h.orders.relay_outbox(Utc::now()).await.unwrap();
        assert_eq!(pass.retried, 1);

        h.client.decrement_down.store(false, Ordering::SeqCst);
        let later = Utc::now() + chrono::Duration::minutes(5);
        let pass = h.orders.relay_outbox(later).await.unwrap();
        assert_eq!(pass.completed, 1);
        assert_eq!(stock(&h).await, 7);
        assert_eq!(order_events(&h, "order.created"), 1);
        assert!(h.outbox.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shipping_does_not_drop_a_queued_decrement() {
        let h = harness(false, None).await;
        h.client.decrement_down.store(true, Ordering::SeqCst);
        let err = h
            .orders
            .place_order(PlaceOrder::new("widget", 3).unwrap())
            .await
            .unwrap_err();
        let ServiceError::DependencyUnavailable { order_id: Some(id), .. } = err else {
            panic!("expected 503 with order id, got {err:?}");
        };

        h.orders.update_status(id, "shipped").await.unwrap();
        h.client.decrement_down.store(false, Ordering::SeqCst);

        let pass = h.orders.relay_outbox(Utc::now()).await.unwrap();
        assert_eq!(pass.completed, 1);
        assert_eq!(stock(&h).await, 7);
        assert_eq!(h.orders.get_order(id).await.unwrap().status, OrderStatus::Shipped);
        assert!(h.outbox.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_order_releases_its_queued_decrement() {
        let h = harness(false, None).await;
        h.client.decrement_down.store(true, Ordering::SeqCst);
        let err = h
            .orders
            .place_order(PlaceOrder::new("widget", 3).unwrap())
            .await
            .unwrap_err();
        let ServiceError::DependencyUnavailable { order_id: Some(id), .. } = err else {
            panic!("expected 503 with order id, got {err:?}");
        };

        h.orders.update_status(id, "cancelled").await.unwrap();
        h.client.decrement_down.store(false, Ordering::SeqCst);

        let pass = h.orders.relay_outbox(Utc::now()).await.unwrap();
        assert_eq!(pass.completed, 1);
        assert_eq!(stock(&h).await, 10);
    }

    #[tokio::test]
    async fn relay_gives_up_after_max_attempts() {
        let h = harness(false, None).await;
        h.client.decrement_down.store(true, Ordering::SeqCst);
        h.orders
            .place_order(PlaceOrder::new("widget", 1).unwrap())
            .await
            .unwrap_err();

        let mut now = Utc::now();
        let mut abandoned = 0;
        for _ in 0..3 {
            abandoned += h.orders.relay_outbox(now).await.unwrap().abandoned;
            now += chrono::Duration::hours(1);
        }
        assert_eq!(abandoned, 1);
        assert!(h.outbox.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_transitions() {
        let h = harness(false, None).await;
        let order = h.orders.place_order(PlaceOrder::new("widget", 1).unwrap()).await.unwrap();

        let shipped = h.orders.update_status(order.id, "shipped").await.unwrap();
        assert_eq!(shipped.status, OrderStatus::Shipped);
        assert_eq!(h.orders.get_order(order.id).await.unwrap().status, OrderStatus::Shipped);

        let err = h.orders.update_status(order.id, "pending").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition(_)));
        let err = h.orders.update_status(order.id, "cancelled").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition(_)));
        let err = h.orders.update_status(order.id, "lost").await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let again = h.orders.update_status(order.id, "shipped").await.unwrap();
        assert_eq!(again.status, OrderStatus::Shipped);
        assert_eq!(order_events(&h, "order.status_changed"), 1);

        let err = h.orders.update_status(OrderId::new(), "shipped").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn event_mode_rejection_cancels_the_order() {
        let h = harness(true, Some(100)).await;
        let order = h.orders.place_order(PlaceOrder::new("widget", 20).unwrap()).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order_events(&h, "order.created"), 1);

        let rejection = RawEnvelope::wrap(InventoryEvent::AdjustmentRejected {
            order_id: order.id,
            name: widget(),
            quantity: 20,
            reason: RejectionReason::InsufficientInventory,
        })
        .unwrap();
        let handler = InventoryEventHandler::new(h.orders.clone());
        handler.handle(&rejection).await.unwrap();
        handler.handle(&rejection).await.unwrap();

        assert_eq!(h.orders.get_order(order.id).await.unwrap().status, OrderStatus::Cancelled);
        assert_eq!(order_events(&h, "order.status_changed"), 1);
    }

    #[tokio::test]
    async fn late_rejection_leaves_a_shipped_order_alone() {
        let h = harness(true, Some(100)).await;
        let order = h.orders.place_order(PlaceOrder::new("widget", 20).unwrap()).await.unwrap();
        h.orders.update_status(order.id, "shipped").await.unwrap();

        let rejection = RawEnvelope::wrap(InventoryEvent::AdjustmentRejected {
            order_id: order.id,
            name: widget(),
            quantity: 20,
            reason: RejectionReason::InsufficientInventory,
        })
        .unwrap();
        let handler = InventoryEventHandler::new(h.orders.clone());
        handler.handle(&rejection).await.unwrap();
        handler.handle(&rejection).await.unwrap();

        assert_eq!(h.orders.get_order(order.id).await.unwrap().status, OrderStatus::Shipped);
        assert_eq!(order_events(&h, "order.status_changed"), 1);
        assert_eq!(stock(&h).await, 10);
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        assert_eq!(retry_delay(1), chrono::Duration::milliseconds(500));
        assert_eq!(retry_delay(2), chrono::Duration::milliseconds(1000));
        assert_eq!(retry_delay(30), chrono::Duration::milliseconds(RETRY_MAX_MS));
    }
}
