use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::{OutboxRecord, OutboxStatus, OutboxStore, OutboxTask};
use crate::store::postgres::map_sqlx_error;
use crate::store::StoreError;

const OUTBOX_COLUMNS: &str = "id, task, status, attempts, last_error, next_attempt_at, created_at";

fn record_from_row(row: &PgRow) -> Result<OutboxRecord, StoreError> {
    let decode = |e| map_sqlx_error("decode outbox record", e);
    let Json(task): Json<OutboxTask> = row.try_get("task").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;

    Ok(OutboxRecord {
        id: row.try_get("id").map_err(decode)?,
        task,
        status: match status.as_str() {
            "pending" => OutboxStatus::Pending,
            "done" => OutboxStatus::Done,
            "abandoned" => OutboxStatus::Abandoned,
            other => return Err(StoreError::Invalid(format!("unknown outbox status '{other}'"))),
        },
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

/// Outbox over the `outbox` table.
#[derive(Debug, Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn expect_one(affected: u64) -> Result<(), StoreError> {
    if affected == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

#[async_trait]
impl OutboxStore for PostgresOutbox {
    #[instrument(skip(self, task), fields(kind = task.kind()), err)]
    async fn enqueue(&self, task: OutboxTask) -> Result<OutboxRecord, StoreError> {
        let record = OutboxRecord::new(task, Utc::now());
        sqlx::query(
            "INSERT INTO outbox (id, task, status, attempts, next_attempt_at, created_at) \
             VALUES ($1, $2, $3, 0, $4, $5)",
        )
        .bind(record.id)
        .bind(Json(&record.task))
        .bind(record.status.as_str())
        .bind(record.next_attempt_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue_outbox", e))?;
        Ok(record)
    }

    /// Claims with `FOR UPDATE SKIP LOCKED`: relays running on other replicas
    /// skip rows another relay is claiming, then see them leased.
    #[instrument(skip(self), err)]
    async fn claim(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: chrono::Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "UPDATE outbox SET next_attempt_at = $2 \
             WHERE id IN ( \
                 SELECT id FROM outbox \
                 WHERE status = 'pending' AND next_attempt_at <= $1 \
                 ORDER BY created_at LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {OUTBOX_COLUMNS}"
        ))
        .bind(now)
        .bind(now + lease)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_outbox", e))?;

        let mut claimed = rows.iter().map(record_from_row).collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not keep the subquery's order.
        claimed.sort_by_key(|r| r.created_at);
        Ok(claimed)
    }

    #[instrument(skip(self), err)]
    async fn pending(&self) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = 'pending' ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_outbox", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn complete(&self, id: Uuid) -> Result<(), StoreError> {
        let affected = sqlx::query("UPDATE outbox SET status = 'done' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete_outbox", e))?
            .rows_affected();
        expect_one(affected)
    }

    #[instrument(skip(self), err)]
    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let affected = sqlx::query(
            "UPDATE outbox SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_outbox", e))?
        .rows_affected();
        expect_one(affected)
    }

    #[instrument(skip(self), err)]
    async fn abandon(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let affected = sqlx::query(
            "UPDATE outbox SET attempts = attempts + 1, last_error = $2, status = 'abandoned' \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("abandon_outbox", e))?
        .rows_affected();
        expect_one(affected)
    }
}
