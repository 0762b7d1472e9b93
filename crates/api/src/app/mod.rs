//! HTTP API application wiring (Axum routers + service wiring).
//!
//! - `services.rs`: infrastructure wiring (stores, cache, bus, workers)
//! - `routes/`: HTTP routes + handlers (one file per service)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: the error taxonomy and its JSON responses
//! - `extract.rs`: body/path extractors that reject with that taxonomy

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;
use tower::limit::GlobalConcurrencyLimitLayer;

use crate::inventory_service::InventoryService;
use crate::order_service::OrderService;

pub mod dto;
pub mod errors;
pub mod extract;
pub mod routes;
pub mod services;

/// Inventory service router. At most `max_in_flight` requests are processed
/// at once across all routes; the rest wait.
pub fn inventory_router(service: Arc<InventoryService>, max_in_flight: usize) -> Router {
    routes::inventory_router().layer(
        ServiceBuilder::new()
            .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
            .layer(Extension(service)),
    )
}

/// Order service router, limited like [`inventory_router`].
pub fn order_router(service: Arc<OrderService>, max_in_flight: usize) -> Router {
    routes::order_router().layer(
        ServiceBuilder::new()
            .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
            .layer(Extension(service)),
    )
}
