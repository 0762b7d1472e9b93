//! Persistent state for both services.
//!
//! Each store is a trait with an in-memory implementation (tests/dev) and a
//! Postgres implementation. Every mutation that has a guard (non-negative
//! quantity, `pending`-only status changes) is a single conditional update in
//! the backing store, never a read followed by a write.

pub mod inventory;
pub mod orders;
pub mod postgres;

pub use inventory::{DecrementOutcome, InMemoryInventoryStore, InventoryStore, LedgerOutcome};
pub use orders::{InMemoryOrderStore, OrderStore};
pub use postgres::{PostgresInventoryStore, PostgresOrderStore};

use orderflow_core::DomainError;
use orderflow_orders::OrderStatus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("adjustment would make quantity negative (available: {available}, delta: {delta})")]
    WouldUnderflow { available: i64, delta: i64 },

    /// A conditional status update found the order in another status.
    #[error("order is {current}, expected {expected}")]
    StatusConflict {
        expected: OrderStatus,
        current: OrderStatus,
    },

    #[error("invalid data: {0}")]
    Invalid(String),

    /// Pool exhausted, connection refused or acquire timed out. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::NotFound => StoreError::NotFound,
            DomainError::WouldUnderflow { available, delta } => {
                StoreError::WouldUnderflow { available, delta }
            }
            DomainError::Conflict(msg) => StoreError::AlreadyExists(msg),
            other => StoreError::Invalid(other.to_string()),
        }
    }
}
