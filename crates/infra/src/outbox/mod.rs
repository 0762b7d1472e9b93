//! Transactional-outbox style deferred work for the order service.
//!
//! When a step after the commit point fails transiently (bus down, inventory
//! service timing out) the order service records the remaining work here and a
//! relay worker retries it until it succeeds or is abandoned.

pub mod postgres;

pub use postgres::PostgresOutbox;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orderflow_core::{OrderId, ProductName};
use orderflow_events::RawEnvelope;

use crate::store::StoreError;

/// Work left over from a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboxTask {
    /// Apply the order's inventory decrement (idempotent by order id).
    AdjustInventory {
        order_id: OrderId,
        product_name: ProductName,
        quantity: i64,
    },
    /// Publish an envelope the bus refused earlier.
    Publish { envelope: RawEnvelope },
}

impl OutboxTask {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboxTask::AdjustInventory { .. } => "adjust_inventory",
            OutboxTask::Publish { .. } => "publish",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Done,
    /// Gave up after too many attempts; needs an operator.
    Abandoned,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Done => "done",
            OutboxStatus::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub task: OutboxTask,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    pub fn new(task: OutboxTask, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            task,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
        }
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn enqueue(&self, task: OutboxTask) -> Result<OutboxRecord, StoreError>;

    /// Claim up to `limit` pending records whose `next_attempt_at` has
    /// passed, oldest first.
    ///
    /// Claimed records are pushed to `now + lease`, so concurrent relays never
    /// receive the same record; one that is neither completed nor rescheduled
    /// comes back once the lease runs out.
    async fn claim(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: chrono::Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    /// All records still pending, due or not.
    async fn pending(&self) -> Result<Vec<OutboxRecord>, StoreError>;

    async fn complete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Count a failed attempt and schedule the next one.
    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn abandon(&self, id: Uuid, error: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn enqueue(&self, task: OutboxTask) -> Result<OutboxRecord, StoreError> {
        (**self).enqueue(task).await
    }

    async fn claim(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: chrono::Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        (**self).claim(now, limit, lease).await
    }

    async fn pending(&self) -> Result<Vec<OutboxRecord>, StoreError> {
        (**self).pending().await
    }

    async fn complete(&self, id: Uuid) -> Result<(), StoreError> {
        (**self).complete(id).await
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).record_failure(id, error, next_attempt_at).await
    }

    async fn abandon(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        (**self).abandon(id, error).await
    }
}

/// In-memory outbox (tests/dev). Records are keyed by their v7 id, so
/// iteration order is creation order.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    records: Mutex<BTreeMap<Uuid, OutboxRecord>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<Uuid, OutboxRecord>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Backend("outbox lock poisoned".to_string()))?;
        f(&mut records)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn enqueue(&self, task: OutboxTask) -> Result<OutboxRecord, StoreError> {
        let record = OutboxRecord::new(task, Utc::now());
        self.with_records(|records| {
            records.insert(record.id, record.clone());
            Ok(record)
        })
    }

    async fn claim(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: chrono::Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        self.with_records(|records| {
            let mut claimed = Vec::new();
            for record in records
                .values_mut()
                .filter(|r| r.status == OutboxStatus::Pending && r.next_attempt_at <= now)
                .take(limit)
            {
                claimed.push(record.clone());
                record.next_attempt_at = now + lease;
            }
            Ok(claimed)
        })
    }

    async fn pending(&self) -> Result<Vec<OutboxRecord>, StoreError> {
        self.with_records(|records| {
            Ok(records
                .values()
                .filter(|r| r.status == OutboxStatus::Pending)
                .cloned()
                .collect())
        })
    }

    async fn complete(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_records(|records| {
            let record = records.get_mut(&id).ok_or(StoreError::NotFound)?;
            record.status = OutboxStatus::Done;
            Ok(())
        })
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_records(|records| {
            let record = records.get_mut(&id).ok_or(StoreError::NotFound)?;
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            record.next_attempt_at = next_attempt_at;
            Ok(())
        })
    }

    async fn abandon(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        self.with_records(|records| {
            let record = records.get_mut(&id).ok_or(StoreError::NotFound)?;
            record.attempts += 1;
            record.status = OutboxStatus::Abandoned;
            record.last_error = Some(error.to_string());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn adjust_task() -> OutboxTask {
        OutboxTask::AdjustInventory {
            order_id: OrderId::new(),
            product_name: ProductName::parse("widget").unwrap(),
            quantity: 2,
        }
    }

    fn lease() -> Duration {
        Duration::seconds(60)
    }

    #[tokio::test]
    async fn failed_records_wait_for_their_next_attempt() {
        let outbox = InMemoryOutbox::new();
        let record = outbox.enqueue(adjust_task()).await.unwrap();
        let now = Utc::now();

        assert_eq!(outbox.claim(now, 10, lease()).await.unwrap().len(), 1);

        outbox
            .record_failure(record.id, "timeout", now + Duration::seconds(30))
            .await
            .unwrap();
        assert!(outbox.claim(now, 10, lease()).await.unwrap().is_empty());

        let later = outbox
            .claim(now + Duration::seconds(31), 10, lease())
            .await
            .unwrap();
        assert_eq!(later[0].attempts, 1);
        assert_eq!(later[0].last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn a_claimed_record_goes_to_one_relay_until_its_lease_ends() {
        let outbox = InMemoryOutbox::new();
        outbox.enqueue(adjust_task()).await.unwrap();
        outbox.enqueue(adjust_task()).await.unwrap();
        let now = Utc::now();

        let first = outbox.claim(now, 1, lease()).await.unwrap();
        let second = outbox.claim(now, 10, lease()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);
        assert!(outbox.claim(now, 10, lease()).await.unwrap().is_empty());

        // Neither relay reported back: both records are handed out again.
        let expired = outbox
            .claim(now + lease() + Duration::seconds(1), 10, lease())
            .await
            .unwrap();
        assert_eq!(expired.len(), 2);
    }

    #[tokio::test]
    async fn completed_and_abandoned_records_leave_the_queue() {
        let outbox = InMemoryOutbox::new();
        let a = outbox.enqueue(adjust_task()).await.unwrap();
        let b = outbox.enqueue(adjust_task()).await.unwrap();

        outbox.complete(a.id).await.unwrap();
        outbox.abandon(b.id, "gave up").await.unwrap();

        assert!(outbox.pending().await.unwrap().is_empty());
    }

    #[test]
    fn task_is_tagged_by_kind() {
        let json = serde_json::to_value(adjust_task()).unwrap();
        assert_eq!(json["kind"], "adjust_inventory");
    }
}
