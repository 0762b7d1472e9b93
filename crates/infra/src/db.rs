//! Postgres pool construction and schema bootstrap.
//!
//! Each service owns its own tables; `ensure_*_schema` is idempotent and runs
//! at startup before the service accepts traffic.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::store::StoreError;
use crate::store::postgres::map_sqlx_error;

const INVENTORY_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS products (
        name        TEXT PRIMARY KEY,
        description TEXT NOT NULL DEFAULT '',
        price       BIGINT NOT NULL CHECK (price >= 0),
        quantity    BIGINT NOT NULL CHECK (quantity >= 0),
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS inventory_order_ledger (
        order_id     UUID PRIMARY KEY,
        product_name TEXT NOT NULL,
        quantity     BIGINT NOT NULL,
        outcome      TEXT NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS inventory_order_ledger_processed_at_idx ON inventory_order_ledger (processed_at)",
];

const ORDER_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id           UUID PRIMARY KEY,
        product_name TEXT NOT NULL,
        quantity     BIGINT NOT NULL CHECK (quantity > 0),
        unit_price   BIGINT NOT NULL CHECK (unit_price >= 0),
        status       TEXT NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS orders_created_at_idx ON orders (created_at, id)",
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        id              UUID PRIMARY KEY,
        task            JSONB NOT NULL,
        status          TEXT NOT NULL DEFAULT 'pending',
        attempts        INTEGER NOT NULL DEFAULT 0,
        last_error      TEXT,
        next_attempt_at TIMESTAMPTZ NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS outbox_due_idx ON outbox (status, next_attempt_at)",
];

/// Pool settings read from configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(3),
        }
    }
}

/// Connect to Postgres. Every query acquires with a bounded timeout, so an
/// exhausted or unreachable database surfaces as `StoreError::Unavailable`.
pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

async fn apply(pool: &PgPool, name: &str, statements: &[&str]) -> Result<(), StoreError> {
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error(name, e))?;
    }
    info!(schema = name, "schema ensured");
    Ok(())
}

pub async fn ensure_inventory_schema(pool: &PgPool) -> Result<(), StoreError> {
    apply(pool, "inventory", INVENTORY_SCHEMA).await
}

pub async fn ensure_order_schema(pool: &PgPool) -> Result<(), StoreError> {
    apply(pool, "orders", ORDER_SCHEMA).await
}
