//! Startup wiring: build stores, cache, bus and clients from configuration,
//! start the background workers, and hand back a router plus the handles
//! needed to shut everything down again.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use reqwest::Url;
use sqlx::PgPool;

use orderflow_events::{BusError, EventBus, InMemoryEventBus, Topic};
use orderflow_infra::cache::Cache;
use orderflow_infra::config::CommonConfig;
use orderflow_infra::outbox::PostgresOutbox;
use orderflow_infra::store::{PostgresInventoryStore, PostgresOrderStore};
use orderflow_infra::{
    AdjustStrategy, CacheError, ConsumerWorker, InMemoryCache, InMemoryInventoryStore,
    InMemoryOrderStore, InMemoryOutbox, InventoryServiceConfig, InventoryStore, OrderServiceConfig,
    OrderStore, OutboxStore, PeriodicWorker, ReadThroughCache, StoreError, WorkerHandle, db,
};

use crate::adjuster::{DirectAdjuster, EventDrivenAdjuster, InventoryAdjuster};
use crate::app;
use crate::inventory_client::{HttpInventoryClient, InventoryClient};
use crate::inventory_service::{self, InventoryService, OrderEventHandler};
use crate::order_service::{self, InventoryEventHandler, OrderService};
use crate::publisher::OutboxPublisher;

const CACHE_EVICTION_INTERVAL: Duration = Duration::from_secs(60);
const LEDGER_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_LEDGER_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
#[cfg(feature = "redis")]
const CACHE_OP_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("invalid INVENTORY_SERVICE_URL '{url}': {reason}")]
    InventoryUrl { url: String, reason: String },

    #[error("http client could not be built: {0}")]
    HttpClient(String),
}

/// A started service: its router, its background workers and its pool.
pub struct ServiceRuntime<S> {
    pub service: Arc<S>,
    pub router: Router,
    workers: Vec<WorkerHandle>,
    pool: Option<PgPool>,
}

impl<S> ServiceRuntime<S> {
    /// Stop the workers, then close the pool.
    pub async fn shutdown(self) {
        for worker in self.workers {
            let name = worker.name();
            worker.shutdown().await;
            tracing::debug!(worker = name, "worker stopped");
        }
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }
}

/// Everything the inventory service runs on.
pub struct InventoryParts {
    pub store: Arc<dyn InventoryStore>,
    pub cache: ReadThroughCache,
    pub bus: Arc<dyn EventBus>,
    pub max_in_flight: usize,
    pub ledger_retention: Duration,
}

impl InventoryParts {
    /// In-memory store and cache on the given bus (tests, local runs).
    pub fn in_memory(bus: Arc<dyn EventBus>) -> Self {
        Self {
            store: Arc::new(InMemoryInventoryStore::new()),
            cache: ReadThroughCache::new(Arc::new(InMemoryCache::new()), Duration::from_secs(300)),
            bus,
            max_in_flight: 256,
            ledger_retention: DEFAULT_LEDGER_RETENTION,
        }
    }
}

/// Everything the order service runs on.
pub struct OrderParts {
    pub orders: Arc<dyn OrderStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub inventory: Arc<dyn InventoryClient>,
    pub bus: Arc<dyn EventBus>,
    pub cache: ReadThroughCache,
    pub strategy: AdjustStrategy,
    pub outbox_poll_interval: Duration,
    pub max_outbox_attempts: u32,
    pub max_in_flight: usize,
}

impl OrderParts {
    pub fn in_memory(
        bus: Arc<dyn EventBus>,
        inventory: Arc<dyn InventoryClient>,
        strategy: AdjustStrategy,
    ) -> Self {
        Self {
            orders: Arc::new(InMemoryOrderStore::new()),
            outbox: Arc::new(InMemoryOutbox::new()),
            inventory,
            bus,
            cache: ReadThroughCache::new(Arc::new(InMemoryCache::new()), Duration::from_secs(300)),
            strategy,
            outbox_poll_interval: Duration::from_secs(1),
            max_outbox_attempts: 20,
            max_in_flight: 256,
        }
    }
}

/// Start the inventory service, its order-event consumer and ledger pruning.
pub async fn start_inventory(
    parts: InventoryParts,
) -> Result<ServiceRuntime<InventoryService>, StartupError> {
    let service = Arc::new(InventoryService::new(parts.store, parts.cache, parts.bus.clone()));

    let subscription = parts
        .bus
        .subscribe(Topic::Orders, inventory_service::CONSUMER_GROUP)
        .await?;
    let consumer = ConsumerWorker::spawn(
        "inventory-order-events",
        subscription,
        Arc::new(OrderEventHandler::new(service.clone())),
    );

    let pruning_service = service.clone();
    let retention = parts.ledger_retention;
    let pruning = PeriodicWorker::spawn("ledger-pruning", LEDGER_PRUNE_INTERVAL, move || {
        let service = pruning_service.clone();
        async move {
            if let Err(e) = service.prune_ledger(Utc::now(), retention).await {
                tracing::warn!(error = %e, "order ledger pruning failed");
            }
        }
    });

    Ok(ServiceRuntime {
        router: app::inventory_router(service.clone(), parts.max_in_flight),
        service,
        workers: vec![consumer, pruning],
        pool: None,
    })
}

/// Start the order service, its inventory-event consumer and the outbox relay.
pub async fn start_orders(parts: OrderParts) -> Result<ServiceRuntime<OrderService>, StartupError> {
    let adjuster: Arc<dyn InventoryAdjuster> = match parts.strategy {
        AdjustStrategy::Direct => Arc::new(DirectAdjuster::new(parts.inventory.clone())),
        AdjustStrategy::Event => Arc::new(EventDrivenAdjuster::new(Arc::new(
            OutboxPublisher::new(parts.bus.clone(), parts.outbox.clone()),
        ))),
    };

    let service = Arc::new(
        OrderService::new(
            parts.orders,
            parts.outbox,
            parts.inventory,
            adjuster,
            parts.bus.clone(),
            parts.cache,
        )
        .with_max_outbox_attempts(parts.max_outbox_attempts),
    );

    let subscription = parts
        .bus
        .subscribe(Topic::Inventory, order_service::CONSUMER_GROUP)
        .await?;
    let consumer = ConsumerWorker::spawn(
        "order-inventory-events",
        subscription,
        Arc::new(InventoryEventHandler::new(service.clone())),
    );

    let relay_service = service.clone();
    let relay = PeriodicWorker::spawn("outbox-relay", parts.outbox_poll_interval, move || {
        let service = relay_service.clone();
        async move {
            if let Err(e) = service.relay_outbox(Utc::now()).await {
                tracing::warn!(error = %e, "outbox relay pass failed");
            }
        }
    });

    Ok(ServiceRuntime {
        router: app::order_router(service.clone(), parts.max_in_flight),
        service,
        workers: vec![consumer, relay],
        pool: None,
    })
}

/// Build the inventory service from configuration.
pub async fn build_inventory_service(
    config: &InventoryServiceConfig,
) -> Result<ServiceRuntime<InventoryService>, StartupError> {
    let common = &config.common;
    let mut workers = Vec::new();

    let pool = connect_pool(common).await?;
    let store: Arc<dyn InventoryStore> = match &pool {
        Some(pool) => {
            db::ensure_inventory_schema(pool).await?;
            Arc::new(PostgresInventoryStore::new(pool.clone()))
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory inventory store");
            Arc::new(InMemoryInventoryStore::new())
        }
    };

    let cache = build_cache(common, &mut workers).await?;
    let bus = build_bus(common).await?;

    let mut runtime = start_inventory(InventoryParts {
        store,
        cache,
        bus,
        max_in_flight: common.max_in_flight,
        ledger_retention: config.ledger_retention,
    })
    .await?;
    runtime.workers.extend(workers);
    runtime.pool = pool;
    Ok(runtime)
}

/// Build the order service from configuration.
pub async fn build_order_service(
    config: &OrderServiceConfig,
) -> Result<ServiceRuntime<OrderService>, StartupError> {
    let common = &config.common;
    let mut workers = Vec::new();

    let pool = connect_pool(common).await?;
    let (orders, outbox): (Arc<dyn OrderStore>, Arc<dyn OutboxStore>) = match &pool {
        Some(pool) => {
            db::ensure_order_schema(pool).await?;
            let orders: Arc<dyn OrderStore> = Arc::new(PostgresOrderStore::new(pool.clone()));
            let outbox: Arc<dyn OutboxStore> = Arc::new(PostgresOutbox::new(pool.clone()));
            (orders, outbox)
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory order store and outbox");
            let orders: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
            let outbox: Arc<dyn OutboxStore> = Arc::new(InMemoryOutbox::new());
            (orders, outbox)
        }
    };

    let url = Url::parse(&config.inventory_service_url).map_err(|e| StartupError::InventoryUrl {
        url: config.inventory_service_url.clone(),
        reason: e.to_string(),
    })?;
    let inventory = HttpInventoryClient::new(url, config.inventory_timeout)
        .map_err(|e| StartupError::HttpClient(e.to_string()))?;

    if config.adjust_strategy == AdjustStrategy::Event && common.redis_url.is_none() {
        tracing::warn!(
            "ADJUST_STRATEGY=event without REDIS_URL: the in-memory bus does not reach the inventory service"
        );
    }

    let cache = build_cache(common, &mut workers).await?;
    let bus = build_bus(common).await?;

    let mut runtime = start_orders(OrderParts {
        orders,
        outbox,
        inventory: Arc::new(inventory),
        bus,
        cache,
        strategy: config.adjust_strategy,
        outbox_poll_interval: config.outbox_poll_interval,
        max_outbox_attempts: config.outbox_max_attempts,
        max_in_flight: common.max_in_flight,
    })
    .await?;
    runtime.workers.extend(workers);
    runtime.pool = pool;
    Ok(runtime)
}

async fn connect_pool(common: &CommonConfig) -> Result<Option<PgPool>, StartupError> {
    match &common.database_url {
        Some(url) => Ok(Some(db::connect(url, &common.pool).await?)),
        None => Ok(None),
    }
}

async fn build_cache(
    common: &CommonConfig,
    workers: &mut Vec<WorkerHandle>,
) -> Result<ReadThroughCache, StartupError> {
    if !common.cache_enabled {
        tracing::info!("cache disabled");
        return Ok(ReadThroughCache::disabled());
    }

    let backend: Arc<dyn Cache> = match &common.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let redis = orderflow_infra::cache::RedisCache::connect(url, CACHE_OP_TIMEOUT).await?;
            tracing::info!("using redis cache");
            Arc::new(redis) as Arc<dyn Cache>
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!("REDIS_URL set but redis feature not enabled, using in-memory cache");
            in_memory_cache(workers)
        }
        None => in_memory_cache(workers),
    };
    Ok(ReadThroughCache::new(backend, common.cache_ttl))
}

fn in_memory_cache(workers: &mut Vec<WorkerHandle>) -> Arc<dyn Cache> {
    let cache = Arc::new(InMemoryCache::new());
    let evicting = cache.clone();
    workers.push(PeriodicWorker::spawn("cache-eviction", CACHE_EVICTION_INTERVAL, move || {
        let cache = evicting.clone();
        async move { cache.evict_expired() }
    }));
    cache
}

async fn build_bus(common: &CommonConfig) -> Result<Arc<dyn EventBus>, StartupError> {
    match &common.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let bus = orderflow_infra::event_bus::RedisStreamsEventBus::connect(
                url,
                common.consumer_name.clone(),
                orderflow_infra::event_bus::StreamsConfig::default(),
            )
            .await?;
            tracing::info!(consumer = %common.consumer_name, "using redis streams event bus");
            Ok(Arc::new(bus) as Arc<dyn EventBus>)
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!("REDIS_URL set but redis feature not enabled, using in-memory bus");
            Ok(Arc::new(InMemoryEventBus::new()))
        }
        None => {
            tracing::info!("REDIS_URL not set, using in-memory event bus");
            Ok(Arc::new(InMemoryEventBus::new()))
        }
    }
}
