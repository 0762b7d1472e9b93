use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::instrument;

use super::{Cache, CacheError};

/// Redis cache backend (`GET`, `SET key value PX ttl`, `DEL`).
///
/// Every command is bounded by `op_timeout`; a slow Redis degrades to cache
/// misses instead of slow requests.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisCache {
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CacheError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Unavailable(format!("redis connect failed: {e}")))?;
        Ok(Self { conn, op_timeout })
    }

    async fn run<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, CacheError> {
        let mut conn = self.conn.clone();
        match tokio::time::timeout(self.op_timeout, cmd.query_async(&mut conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::Unavailable(e.to_string())),
            Err(_) => Err(CacheError::Unavailable(format!(
                "redis command timed out after {:?}",
                self.op_timeout
            ))),
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    #[instrument(skip(self), level = "debug", err)]
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd).await
    }

    #[instrument(skip(self, value), level = "debug", err)]
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let millis = ttl.as_millis().min(u64::MAX as u128) as u64;
        if millis == 0 {
            return Ok(());
        }
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(millis);
        self.run::<()>(cmd).await
    }

    #[instrument(skip(self), level = "debug", err)]
    async fn invalidate(&self, keys: &[&str]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.run::<u64>(cmd).await.map(|_| ())
    }
}
