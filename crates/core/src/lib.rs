//! `orderflow-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the shared error model, strongly-typed identifiers, and the `Entity` trait
//! used to namespace cache keys and log fields.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{EventId, OrderId, ProductName};
