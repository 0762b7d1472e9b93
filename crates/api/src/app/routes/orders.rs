use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use orderflow_core::OrderId;
use orderflow_orders::PlaceOrder;

use crate::app::dto;
use crate::app::errors::ServiceError;
use crate::app::extract::{ApiJson, ApiPath};
use crate::order_service::OrderService;

pub fn router() -> Router {
    Router::new()
        .route("/order", post(place_order))
        .route("/order/:id", get(get_order).put(update_status))
        .route("/orders", get(list_orders))
}

fn parse_id(raw: &str) -> Result<OrderId, ServiceError> {
    OrderId::from_str(raw).map_err(ServiceError::from)
}

pub async fn place_order(
    Extension(service): Extension<Arc<OrderService>>,
    ApiJson(body): ApiJson<dto::PlaceOrderRequest>,
) -> axum::response::Response {
    let request = match PlaceOrder::new(body.product_name, body.quantity) {
        Ok(r) => r,
        Err(e) => return ServiceError::from(e).into_response(),
    };

    match service.place_order(request).await {
        Ok(order) => (StatusCode::CREATED, Json(dto::OrderResponse::from(order))).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn get_order(
    Extension(service): Extension<Arc<OrderService>>,
    ApiPath(id): ApiPath<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    match service.get_order(id).await {
        Ok(order) => Json(dto::OrderResponse::from(order)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn list_orders(
    Extension(service): Extension<Arc<OrderService>>,
) -> axum::response::Response {
    match service.list_orders().await {
        Ok(orders) => Json(
            orders
                .into_iter()
                .map(dto::OrderResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn update_status(
    Extension(service): Extension<Arc<OrderService>>,
    ApiPath(id): ApiPath<String>,
    ApiJson(body): ApiJson<dto::UpdateStatusRequest>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    match service.update_status(id, &body.status).await {
        Ok(order) => Json(dto::OrderResponse::from(order)).into_response(),
        Err(e) => e.into_response(),
    }
}
