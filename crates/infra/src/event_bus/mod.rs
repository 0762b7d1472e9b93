//! Infrastructure event bus implementations.
//!
//! The bus abstraction and the in-memory bus live in `orderflow-events`. This
//! module provides the Redis-backed implementation.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsEventBus, StreamsConfig};
