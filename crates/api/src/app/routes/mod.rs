use axum::{routing::get, Router};

pub mod orders;
pub mod products;
pub mod system;

/// Inventory service endpoints.
pub fn inventory_router() -> Router {
    products::router().route("/health", get(system::health))
}

/// Order service endpoints.
pub fn order_router() -> Router {
    orders::router().route("/health", get(system::health))
}
