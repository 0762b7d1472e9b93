use std::sync::Arc;

use axum::{
    extract::Extension,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use orderflow_core::ProductName;
use orderflow_inventory::NewProduct;

use crate::app::dto;
use crate::app::errors::ServiceError;
use crate::app::extract::{ApiJson, ApiPath};
use crate::inventory_service::InventoryService;

pub fn router() -> Router {
    Router::new()
        .route("/product", post(create_product))
        .route(
            "/product/:name",
            get(get_product).put(adjust_inventory).delete(delete_product),
        )
        .route("/products", get(list_products))
}

pub async fn create_product(
    Extension(service): Extension<Arc<InventoryService>>,
    ApiJson(body): ApiJson<dto::CreateProductRequest>,
) -> axum::response::Response {
    let product = match NewProduct::new(body.name, body.description, body.price, body.quantity) {
        Ok(p) => p,
        Err(e) => return ServiceError::from(e).into_response(),
    };

    match service.create_product(product).await {
        Ok(created) => Json(created).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn get_product(
    Extension(service): Extension<Arc<InventoryService>>,
    ApiPath(name): ApiPath<String>,
) -> axum::response::Response {
    let name = match ProductName::parse(name) {
        Ok(n) => n,
        Err(e) => return ServiceError::from(e).into_response(),
    };

    match service.get_product(&name).await {
        Ok(product) => Json(product).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn list_products(
    Extension(service): Extension<Arc<InventoryService>>,
) -> axum::response::Response {
    match service.list_products().await {
        Ok(products) => Json(products).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn adjust_inventory(
    Extension(service): Extension<Arc<InventoryService>>,
    ApiPath(name): ApiPath<String>,
    ApiJson(body): ApiJson<dto::AdjustInventoryRequest>,
) -> axum::response::Response {
    let name = match ProductName::parse(name) {
        Ok(n) => n,
        Err(e) => return ServiceError::from(e).into_response(),
    };

    match service.adjust_inventory(&name, body.delta, body.order_id).await {
        Ok(product) => Json(product).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_product(
    Extension(service): Extension<Arc<InventoryService>>,
    ApiPath(name): ApiPath<String>,
) -> axum::response::Response {
    let name = match ProductName::parse(name) {
        Ok(n) => n,
        Err(e) => return ServiceError::from(e).into_response(),
    };

    match service.delete_product(&name).await {
        Ok(product) => Json(product).into_response(),
        Err(e) => e.into_response(),
    }
}
