//! Read-through cache in front of the stores.
//!
//! Keys are derived from [`Entity`] kinds (`product:{name}`, `product:all`,
//! `order:{id}`, `order:all`). Values are JSON. The cache is never the source
//! of truth: write paths invalidate before responding, and every cache failure
//! is logged and treated as a miss.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use orderflow_core::Entity;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache value could not be encoded or decoded: {0}")]
    Codec(String),
}

/// A cache key namespaced by entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key of one entity: `{kind}:{id}`.
    pub fn entity<E: Entity>(id: &E::Id) -> Self {
        Self(format!("{}:{}", E::KIND, id))
    }

    /// Key of the full collection: `{kind}:all`.
    pub fn collection<E: Entity>() -> Self {
        Self(format!("{}:all", E::KIND))
    }

    /// The entity key plus its collection key; what every write invalidates.
    pub fn entity_and_collection<E: Entity>(id: &E::Id) -> [Self; 2] {
        [Self::entity::<E>(id), Self::collection::<E>()]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw key/value cache backend.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn invalidate(&self, keys: &[&str]) -> Result<(), CacheError>;
}

#[async_trait]
impl<C> Cache for Arc<C>
where
    C: Cache + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn invalidate(&self, keys: &[&str]) -> Result<(), CacheError> {
        (**self).invalidate(keys).await
    }
}

/// Backend used when caching is disabled: every read misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn invalidate(&self, _keys: &[&str]) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Typed, failure-tolerant view over a [`Cache`] backend.
///
/// Every invalidation bumps `epoch` before touching the backend. A load that
/// overlapped an invalidation never leaves its value behind, so a read that
/// follows a completed write cannot be served the pre-write snapshot.
#[derive(Clone)]
pub struct ReadThroughCache {
    backend: Arc<dyn Cache>,
    ttl: Duration,
    epoch: Arc<AtomicU64>,
}

impl core::fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReadThroughCache").field("ttl", &self.ttl).finish()
    }
}

impl ReadThroughCache {
    pub fn new(backend: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoCache), Duration::ZERO)
    }

    /// Cached value for `key`, or `None` on miss, backend failure or a value
    /// that no longer decodes.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = match self.backend.get(key.as_str()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(cache_key = %key, "cache miss");
                return None;
            }
            Err(err) => {
                warn!(cache_key = %key, error = %err, "cache read failed, falling back to store");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(cache_key = %key, "cache hit");
                Some(value)
            }
            Err(err) => {
                warn!(cache_key = %key, error = %err, "cached value did not decode, ignoring");
                None
            }
        }
    }

    pub async fn put<T: Serialize + Sync>(&self, key: &CacheKey, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(cache_key = %key, error = %err, "cache value did not encode");
                return;
            }
        };
        if let Err(err) = self.backend.set(key.as_str(), raw, self.ttl).await {
            warn!(cache_key = %key, error = %err, "cache write failed");
        }
    }

    /// Drop `keys`. Called synchronously on every write path.
    pub async fn invalidate(&self, keys: &[CacheKey]) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let raw: Vec<&str> = keys.iter().map(CacheKey::as_str).collect();
        if let Err(err) = self.backend.invalidate(&raw).await {
            warn!(cache_keys = ?raw, error = %err, "cache invalidation failed");
        }
    }

    /// Return the cached value or load it, caching what the loader finds.
    ///
    /// `Ok(None)` from the loader (not found) is not cached, and neither is a
    /// value loaded while an invalidation ran.
    pub async fn read_through<T, E, F, Fut>(&self, key: &CacheKey, load: F) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(Some(hit));
        }
        let started = self.epoch.load(Ordering::SeqCst);
        let loaded = load().await?;
        if let Some(value) = &loaded {
            if self.epoch.load(Ordering::SeqCst) != started {
                debug!(cache_key = %key, "write raced the load, not caching");
                return Ok(loaded);
            }
            self.put(key, value).await;
            // An invalidation that slipped in between the check and the put.
            if self.epoch.load(Ordering::SeqCst) != started {
                self.invalidate(std::slice::from_ref(key)).await;
            }
        }
        Ok(loaded)
    }
}
