//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams (XADD/XREADGROUP/XACK) to provide:
//! - **Durable delivery**: entries persist until every group has acknowledged them
//! - **At-least-once**: unacknowledged entries are re-read after a restart and
//!   reclaimed from dead consumers once idle long enough
//! - **Fanout**: one consumer group per service; consumers in a group share load
//! - **Dead-letter handling**: entries delivered more than `max_deliveries` times,
//!   or that cannot be decoded, move to the topic's DLQ stream
//!
//! ## Architecture
//!
//! - **Stream key**: `{prefix}:{topic}` (e.g. `orderflow:orders`)
//! - **Consumer groups**: one per service (`inventory-service`, `order-service`),
//!   created from id `0` so a new group replays the stream's history
//! - **Consumers**: named per process (`CONSUMER_NAME`)
//! - **Dead-letter queue**: `{prefix}:{topic}:dlq`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, error, info, instrument, warn};

use orderflow_events::{Acknowledge, BusError, Delivery, EventBus, RawEnvelope, Subscription, Topic};

const DEFAULT_PREFIX: &str = "orderflow";

/// Tuning knobs for the streams bus.
#[derive(Debug, Clone)]
pub struct StreamsConfig {
    pub prefix: String,
    /// Deliveries after which an entry is dead-lettered.
    pub max_deliveries: u64,
    /// Idle time after which another consumer's pending entry is reclaimed.
    pub claim_idle: Duration,
    /// How long one XREADGROUP blocks waiting for new entries.
    pub block: Duration,
    /// Entries read per round trip.
    pub batch: usize,
    /// Deliveries handed out but not yet acknowledged, per subscription.
    pub max_unacked: usize,
    /// Deadline for XADD / XACK.
    pub op_timeout: Duration,
    /// Approximate cap on each stream's length (`XADD MAXLEN ~`). Entries
    /// trimmed before a lagging group read them are lost to that group.
    pub max_len: usize,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            max_deliveries: 5,
            claim_idle: Duration::from_secs(60),
            block: Duration::from_millis(1000),
            batch: 16,
            max_unacked: 64,
            op_timeout: Duration::from_secs(2),
            max_len: 100_000,
        }
    }
}

impl StreamsConfig {
    pub fn stream_key(&self, topic: Topic) -> String {
        format!("{}:{}", self.prefix, topic.as_str())
    }

    pub fn dlq_key(&self, topic: Topic) -> String {
        format!("{}:{}:dlq", self.prefix, topic.as_str())
    }
}

fn unavailable(context: &str, err: redis::RedisError) -> BusError {
    BusError::Unavailable(format!("{context}: {err}"))
}

#[derive(Clone)]
pub struct RedisStreamsEventBus {
    client: redis::Client,
    conn: ConnectionManager,
    consumer_name: String,
    config: Arc<StreamsConfig>,
}

impl core::fmt::Debug for RedisStreamsEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsEventBus")
            .field("consumer_name", &self.consumer_name)
            .field("config", &self.config)
            .finish()
    }
}

impl RedisStreamsEventBus {
    /// Connect to Redis.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `consumer_name` - this process's name inside every consumer group
    pub async fn connect(
        redis_url: &str,
        consumer_name: impl Into<String>,
        config: StreamsConfig,
    ) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url).map_err(|e| unavailable("invalid redis url", e))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| unavailable("redis connect failed", e))?;

        Ok(Self {
            client,
            conn,
            consumer_name: consumer_name.into(),
            config: Arc::new(config),
        })
    }

    async fn bounded<T>(
        &self,
        context: &str,
        fut: impl core::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, BusError> {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(result) => result.map_err(|e| unavailable(context, e)),
            Err(_) => Err(BusError::Timeout(self.config.op_timeout)),
        }
    }
}

/// Create `group` on `stream` if it does not exist yet (idempotent).
///
/// MKSTREAM creates the stream too; id `0` means the group starts from the
/// beginning of the stream.
async fn ensure_group(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
) -> Result<(), BusError> {
    let created: redis::RedisResult<()> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg("0")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;

    match created {
        Ok(()) => {
            info!(stream, group, "consumer group created");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(unavailable("XGROUP CREATE failed", e)),
    }
}

#[async_trait]
impl EventBus for RedisStreamsEventBus {
    #[instrument(
        skip(self, envelope),
        fields(
            topic = %envelope.topic(),
            event_type = %envelope.event_type(),
            idempotency_key = %envelope.idempotency_key()
        ),
        err
    )]
    async fn publish(&self, envelope: RawEnvelope) -> Result<(), BusError> {
        let payload = serde_json::to_string(&envelope)?;
        let stream = self.config.stream_key(envelope.topic());
        let mut conn = self.conn.clone();

        let cmd = append_cmd(&stream, self.config.max_len, &envelope, &payload);
        let id: String = self.bounded("XADD failed", cmd.query_async(&mut conn)).await?;
        debug!(stream = %stream, entry_id = %id, "event appended");
        Ok(())
    }

    async fn subscribe(&self, topic: Topic, group: &str) -> Result<Subscription, BusError> {
        let stream = self.config.stream_key(topic);

        // Blocking reads get their own connection so they never stall publishes.
        let mut read_conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| unavailable("redis connect failed", e))?;
        ensure_group(&mut read_conn, &stream, group).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = StreamReader {
            topic,
            stream,
            dlq: self.config.dlq_key(topic),
            group: group.to_string(),
            consumer: self.consumer_name.clone(),
            read_conn,
            ack_conn: self.conn.clone(),
            config: self.config.clone(),
            in_flight: Arc::new(Semaphore::new(self.config.max_unacked.max(1))),
            tx,
        };
        tokio::spawn(reader.run());

        Ok(Subscription::new(topic, rx))
    }
}

/// XACKs one entry when the consumer acknowledges the delivery. Holds an
/// in-flight permit until then.
struct StreamAck {
    conn: ConnectionManager,
    stream: String,
    group: String,
    entry_id: String,
    op_timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acknowledge for StreamAck {
    async fn ack(&self) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let acked: redis::RedisResult<u64> = match tokio::time::timeout(
            self.op_timeout,
            redis::cmd("XACK")
                .arg(&self.stream)
                .arg(&self.group)
                .arg(&self.entry_id)
                .query_async(&mut conn),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => return Err(BusError::Timeout(self.op_timeout)),
        };
        acked.map(|_| ()).map_err(|e| unavailable("XACK failed", e))
    }
}

/// Background task feeding one subscription.
struct StreamReader {
    topic: Topic,
    stream: String,
    dlq: String,
    group: String,
    consumer: String,
    read_conn: ConnectionManager,
    ack_conn: ConnectionManager,
    config: Arc<StreamsConfig>,
    in_flight: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl StreamReader {
    async fn run(mut self) {
        info!(topic = %self.topic, group = %self.group, consumer = %self.consumer, "stream reader started");

        // Entries this consumer read before a restart but never acknowledged.
        if let Err(e) = self.read_and_forward("0", None).await {
            warn!(topic = %self.topic, error = %e, "could not re-read pending entries");
        }

        let mut last_claim = tokio::time::Instant::now();
        let mut backoff = Duration::from_millis(100);

        while !self.tx.is_closed() {
            if last_claim.elapsed() >= self.config.claim_idle {
                if let Err(e) = self.reclaim_idle().await {
                    warn!(topic = %self.topic, error = %e, "reclaiming idle entries failed");
                }
                last_claim = tokio::time::Instant::now();
            }

            match self.read_and_forward(">", Some(self.config.block)).await {
                Ok(()) => backoff = Duration::from_millis(100),
                Err(e) => {
                    warn!(topic = %self.topic, group = %self.group, error = %e, "stream read failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                    // The group may have vanished with the stream (FLUSHALL, failover).
                    if let Err(e) = ensure_group(&mut self.read_conn, &self.stream, &self.group).await {
                        warn!(topic = %self.topic, error = %e, "re-declaring consumer group failed");
                    }
                }
            }
        }

        info!(topic = %self.topic, group = %self.group, "stream reader stopped");
    }

    async fn read_and_forward(&mut self, from: &str, block: Option<Duration>) -> Result<(), BusError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.config.batch);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(&self.stream).arg(from);

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut self.read_conn)
            .await
            .map_err(|e| unavailable("XREADGROUP failed", e))?;

        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect::<Vec<_>>())
            .unwrap_or_default();
        for entry in entries {
            self.forward(entry).await?;
        }
        Ok(())
    }

    /// Claim entries other consumers left idle; dead-letter the ones that
    /// keep failing.
    async fn reclaim_idle(&mut self) -> Result<(), BusError> {
        let idle_ms = self.config.claim_idle.as_millis() as u64;
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(self.config.batch)
            .query_async(&mut self.read_conn)
            .await
            .map_err(|e| unavailable("XPENDING failed", e))?;

        for stale in pending.ids {
            let mut claim = redis::cmd("XCLAIM");
            claim
                .arg(&self.stream)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(idle_ms)
                .arg(&stale.id);
            let claimed: StreamClaimReply = claim
                .query_async(&mut self.read_conn)
                .await
                .map_err(|e| unavailable("XCLAIM failed", e))?;

            for entry in claimed.ids {
                if stale.times_delivered as u64 >= self.config.max_deliveries {
                    self.dead_letter(&entry, &format!("delivered {} times", stale.times_delivered))
                        .await?;
                } else {
                    self.forward(entry).await?;
                }
            }
        }
        Ok(())
    }

    async fn forward(&mut self, entry: StreamId) -> Result<(), BusError> {
        let envelope = match decode_entry(&entry) {
            Ok(envelope) => envelope,
            Err(e) => return self.dead_letter(&entry, &e.to_string()).await,
        };

        let permit = match self.in_flight.clone().acquire_owned().await {
            Ok(permit) => permit,
            // Semaphore closed: the bus is shutting down.
            Err(_) => return Ok(()),
        };

        let acker = StreamAck {
            conn: self.ack_conn.clone(),
            stream: self.stream.clone(),
            group: self.group.clone(),
            entry_id: entry.id.clone(),
            op_timeout: self.config.op_timeout,
            _permit: permit,
        };
        if self
            .tx
            .send(Delivery::with_acker(envelope, Box::new(acker)))
            .is_err()
        {
            debug!(topic = %self.topic, "subscriber dropped, entry stays pending");
        }
        Ok(())
    }

    async fn dead_letter(&mut self, entry: &StreamId, reason: &str) -> Result<(), BusError> {
        let payload: String = entry.get("payload").unwrap_or_default();
        let mut conn = self.ack_conn.clone();

        let _: String = redis::cmd("XADD")
            .arg(&self.dlq)
            .arg("*")
            .arg("original_entry_id")
            .arg(&entry.id)
            .arg("group")
            .arg(&self.group)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("DLQ XADD failed", e))?;

        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&entry.id)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("XACK failed", e))?;

        error!(
            topic = %self.topic,
            group = %self.group,
            entry_id = %entry.id,
            reason,
            "entry moved to dead-letter queue"
        );
        Ok(())
    }
}

/// `XADD` with approximate trimming, so acknowledged history does not pile up.
fn append_cmd(stream: &str, max_len: usize, envelope: &RawEnvelope, payload: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream)
        .arg("MAXLEN")
        .arg("~")
        .arg(max_len)
        .arg("*")
        .arg("event_type")
        .arg(envelope.event_type())
        .arg("idempotency_key")
        .arg(envelope.idempotency_key())
        .arg("payload")
        .arg(payload);
    cmd
}

fn decode_entry(entry: &StreamId) -> Result<RawEnvelope, BusError> {
    let payload: String = entry
        .get("payload")
        .ok_or_else(|| BusError::Serialization("entry has no payload field".to_string()))?;
    Ok(serde_json::from_str(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_per_topic() {
        let cfg = StreamsConfig::default();
        assert_eq!(cfg.stream_key(Topic::Orders), "orderflow:orders");
        assert_eq!(cfg.stream_key(Topic::Inventory), "orderflow:inventory");
        assert_eq!(cfg.dlq_key(Topic::Orders), "orderflow:orders:dlq");
    }

    #[test]
    fn appends_trim_the_stream() {
        let envelope = RawEnvelope::wrap(orderflow_inventory::InventoryEvent::ProductDeleted {
            name: orderflow_core::ProductName::parse("widget").unwrap(),
        })
        .unwrap();
        let cmd = append_cmd("orderflow:inventory", 500, &envelope, "{}");

        let args: Vec<String> = cmd
            .args_iter()
            .filter_map(|arg| match arg {
                redis::Arg::Simple(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                redis::Arg::Cursor => None,
            })
            .collect();
        assert_eq!(args[..6], ["XADD", "orderflow:inventory", "MAXLEN", "~", "500", "*"]);
    }
}
