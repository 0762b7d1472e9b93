//! Infrastructure layer: stores, outbox, cache, Redis event bus, config, workers.

pub mod cache;
pub mod config;
pub mod db;
pub mod event_bus;
pub mod outbox;
pub mod store;
pub mod workers;

pub use cache::{Cache, CacheError, CacheKey, InMemoryCache, NoCache, ReadThroughCache};
pub use config::{AdjustStrategy, ConfigError, InventoryServiceConfig, OrderServiceConfig};
pub use outbox::{InMemoryOutbox, OutboxRecord, OutboxStatus, OutboxStore, OutboxTask};
pub use store::{
    DecrementOutcome, InMemoryInventoryStore, InMemoryOrderStore, InventoryStore, OrderStore,
    StoreError,
};
pub use workers::{ConsumerWorker, PeriodicWorker, WorkerHandle};
