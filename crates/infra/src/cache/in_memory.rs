use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Cache, CacheError};

/// Process-local TTL cache (tests/dev).
///
/// Expired entries are evicted lazily on access.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> CacheError {
        CacheError::Unavailable("in-memory cache lock poisoned".to_string())
    }

    /// Drop every expired entry.
    pub fn evict_expired(&self) {
        if let Ok(mut entries) = self.entries.write() {
            let now = Instant::now();
            entries.retain(|_, (_, expires_at)| *expires_at > now);
        }
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        {
            let entries = self.entries.read().map_err(|_| Self::poisoned())?;
            match entries.get(key) {
                None => return Ok(None),
                Some((value, expires_at)) if *expires_at > Instant::now() => {
                    return Ok(Some(value.clone()));
                }
                Some(_) => {}
            }
        }
        // Expired: drop the read guard before removing.
        self.entries
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Ok(());
        }
        self.entries
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn invalidate(&self, keys: &[&str]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryCache::new();
        cache
            .set("order:all", "[]".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(cache.get("order:all").await.unwrap().as_deref(), Some("[]"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("order:all").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidate_removes_every_named_key() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("product:widget", "{}".into(), ttl).await.unwrap();
        cache.set("product:all", "[]".into(), ttl).await.unwrap();
        cache.set("product:gadget", "{}".into(), ttl).await.unwrap();

        cache.invalidate(&["product:widget", "product:all"]).await.unwrap();

        assert_eq!(cache.get("product:widget").await.unwrap(), None);
        assert_eq!(cache.get("product:all").await.unwrap(), None);
        assert!(cache.get("product:gadget").await.unwrap().is_some());
    }
}
