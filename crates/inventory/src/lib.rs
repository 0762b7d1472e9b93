//! Inventory domain module.
//!
//! Business rules for product stock, implemented as deterministic domain logic
//! (no IO, no HTTP, no storage). Stores call [`apply_delta`] inside their
//! atomic update so the underflow guard is the same everywhere.

pub mod events;
pub mod product;

pub use events::{InventoryEvent, RejectionReason};
pub use product::{Adjustment, NewProduct, Product, apply_delta};
