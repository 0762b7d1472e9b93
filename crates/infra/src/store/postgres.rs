//! Postgres-backed stores.
//!
//! Guarded mutations are single conditional `UPDATE ... RETURNING` statements;
//! the follow-up `SELECT` after a zero-row update only classifies the failure
//! and never feeds a write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use orderflow_core::{OrderId, ProductName};
use orderflow_inventory::{Adjustment, NewProduct, Product};
use orderflow_orders::{Order, OrderStatus};

use super::inventory::{DecrementOutcome, InventoryStore, LedgerOutcome};
use super::orders::OrderStore;
use super::StoreError;

/// Map a sqlx error into the store taxonomy.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // unique_violation
                Some("23505") => StoreError::AlreadyExists(msg),
                // check_violation, numeric_value_out_of_range
                Some("23514") | Some("22003") => StoreError::Invalid(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        other => StoreError::Backend(format!("sqlx error in {}: {}", operation, other)),
    }
}

fn to_db_price(price: u64) -> Result<i64, StoreError> {
    i64::try_from(price).map_err(|_| StoreError::Invalid(format!("price {price} out of range")))
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    let name: String = row
        .try_get("name")
        .map_err(|e| map_sqlx_error("decode product", e))?;
    let price: i64 = row
        .try_get("price")
        .map_err(|e| map_sqlx_error("decode product", e))?;
    Ok(Product {
        name: ProductName::parse(name)?,
        description: row
            .try_get("description")
            .map_err(|e| map_sqlx_error("decode product", e))?,
        price: u64::try_from(price)
            .map_err(|_| StoreError::Invalid(format!("negative price {price} in store")))?,
        quantity: row
            .try_get("quantity")
            .map_err(|e| map_sqlx_error("decode product", e))?,
    })
}

const PRODUCT_COLUMNS: &str = "name, description, price, quantity";

/// Inventory store over the `products` and `inventory_order_ledger` tables.
#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Classify a guarded update that matched no row.
    async fn classify_miss<'e, E>(
        executor: E,
        name: &ProductName,
        delta: i64,
    ) -> Result<StoreError, StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let current: Option<i64> = sqlx::query_scalar("SELECT quantity FROM products WHERE name = $1")
            .bind(name.as_str())
            .fetch_optional(executor)
            .await
            .map_err(|e| map_sqlx_error("classify_adjust", e))?;

        Ok(match current {
            None => StoreError::NotFound,
            Some(available) => StoreError::WouldUnderflow { available, delta },
        })
    }
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    #[instrument(skip(self, product), fields(product = %product.name), err)]
    async fn create(&self, product: NewProduct) -> Result<Product, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO products (name, description, price, quantity) \
             VALUES ($1, $2, $3, $4) RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(product.name.as_str())
        .bind(&product.description)
        .bind(to_db_price(product.price)?)
        .bind(product.quantity)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match map_sqlx_error("create_product", e) {
            StoreError::AlreadyExists(_) => StoreError::AlreadyExists(product.name.to_string()),
            other => other,
        })?;

        product_from_row(&row)
    }

    #[instrument(skip(self), fields(product = %name), err)]
    async fn get(&self, name: &ProductName) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE name = $1"
        ))
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_product", e))?;

        row.as_ref().map(product_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_products", e))?;

        rows.iter().map(product_from_row).collect()
    }

    #[instrument(skip(self), fields(product = %name, delta = adjustment.delta()), err)]
    async fn adjust(
        &self,
        name: &ProductName,
        adjustment: Adjustment,
    ) -> Result<Product, StoreError> {
        let delta = adjustment.delta();
        let row = sqlx::query(&format!(
            "UPDATE products SET quantity = quantity + $2, updated_at = NOW() \
             WHERE name = $1 AND quantity + $2 >= 0 RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(name.as_str())
        .bind(delta)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("adjust_inventory", e))?;

        match row {
            Some(row) => product_from_row(&row),
            None => Err(Self::classify_miss(&self.pool, name, delta).await?),
        }
    }

    #[instrument(skip(self), fields(order_id = %order_id, product = %name), err)]
    async fn apply_order_decrement(
        &self,
        order_id: OrderId,
        name: &ProductName,
        quantity: i64,
    ) -> Result<DecrementOutcome, StoreError> {
        let delta = Adjustment::decrement(quantity)?.delta();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_order_decrement", e))?;

        // Concurrent deliveries of the same order serialize on the primary key.
        let claimed = sqlx::query(
            "INSERT INTO inventory_order_ledger (order_id, product_name, quantity, outcome) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (order_id) DO NOTHING",
        )
        .bind(order_id.as_uuid())
        .bind(name.as_str())
        .bind(quantity)
        .bind(LedgerOutcome::Applied.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_order_decrement", e))?
        .rows_affected()
            == 1;

        if !claimed {
            let recorded: String =
                sqlx::query_scalar("SELECT outcome FROM inventory_order_ledger WHERE order_id = $1")
                    .bind(order_id.as_uuid())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("read_order_ledger", e))?;
            let outcome = LedgerOutcome::parse(&recorded).ok_or_else(|| {
                StoreError::Invalid(format!("unknown ledger outcome '{recorded}'"))
            })?;
            let result = match outcome {
                LedgerOutcome::Applied => Ok(DecrementOutcome::AlreadyApplied),
                LedgerOutcome::RejectedNotFound => Err(StoreError::NotFound),
                LedgerOutcome::RejectedUnderflow => {
                    Err(Self::classify_miss(&mut *tx, name, delta).await?)
                }
            };
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_order_decrement", e))?;
            return result;
        }

        let row = sqlx::query(&format!(
            "UPDATE products SET quantity = quantity + $2, updated_at = NOW() \
             WHERE name = $1 AND quantity + $2 >= 0 RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(name.as_str())
        .bind(delta)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("apply_order_decrement", e))?;

        let result = match row {
            Some(row) => Ok(DecrementOutcome::Applied(product_from_row(&row)?)),
            None => {
                let rejection = Self::classify_miss(&mut *tx, name, delta).await?;
                let outcome = match rejection {
                    StoreError::NotFound => LedgerOutcome::RejectedNotFound,
                    _ => LedgerOutcome::RejectedUnderflow,
                };
                sqlx::query("UPDATE inventory_order_ledger SET outcome = $2 WHERE order_id = $1")
                    .bind(order_id.as_uuid())
                    .bind(outcome.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("record_rejection", e))?;
                Err(rejection)
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_order_decrement", e))?;
        result
    }

    #[instrument(skip(self), fields(product = %name), err)]
    async fn delete(&self, name: &ProductName) -> Result<Product, StoreError> {
        let row = sqlx::query(&format!(
            "DELETE FROM products WHERE name = $1 RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_product", e))?;

        match row {
            Some(row) => product_from_row(&row),
            None => Err(StoreError::NotFound),
        }
    }

    #[instrument(skip(self), err)]
    async fn prune_ledger(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let pruned = sqlx::query("DELETE FROM inventory_order_ledger WHERE processed_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("prune_order_ledger", e))?
            .rows_affected();
        Ok(pruned)
    }
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let decode = |e| map_sqlx_error("decode order", e);
    let id: Uuid = row.try_get("id").map_err(decode)?;
    let product_name: String = row.try_get("product_name").map_err(decode)?;
    let unit_price: i64 = row.try_get("unit_price").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;

    Ok(Order {
        id: OrderId::from_uuid(id),
        product_name: ProductName::parse(product_name)?,
        quantity: row.try_get("quantity").map_err(decode)?,
        unit_price: u64::try_from(unit_price)
            .map_err(|_| StoreError::Invalid(format!("negative unit price {unit_price} in store")))?,
        status: status.parse::<OrderStatus>()?,
        created_at,
    })
}

const ORDER_COLUMNS: &str = "id, product_name, quantity, unit_price, status, created_at";

/// Order store over the `orders` table.
#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    #[instrument(skip(self, order), fields(order_id = %order.id, product = %order.product_name), err)]
    async fn insert(&self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO orders (id, product_name, quantity, unit_price, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(order.id.as_uuid())
        .bind(order.product_name.as_str())
        .bind(order.quantity)
        .bind(to_db_price(order.unit_price)?)
        .bind(order.status.as_str())
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    async fn get(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_order", e))?;

        row.as_ref().map(order_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_orders", e))?;

        rows.iter().map(order_from_row).collect()
    }

    #[instrument(skip(self), fields(order_id = %id, expected = %expected, to = %to), err)]
    async fn update_status(
        &self,
        id: OrderId,
        expected: OrderStatus,
        to: OrderStatus,
    ) -> Result<Order, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE orders SET status = $3 WHERE id = $1 AND status = $2 RETURNING {ORDER_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_order_status", e))?;

        if let Some(row) = row {
            return order_from_row(&row);
        }

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("classify_status_update", e))?;

        match current {
            None => Err(StoreError::NotFound),
            Some(current) => Err(StoreError::StatusConflict {
                expected,
                current: current.parse::<OrderStatus>()?,
            }),
        }
    }
}
