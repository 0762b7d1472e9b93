use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use orderflow_core::{DomainError, OrderId};
use orderflow_infra::StoreError;

/// Every failure a request can end in.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// Insufficient inventory, underflow, duplicate product.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidTransition(String),

    /// A dependency (store, inventory service, broker) is down or timed out.
    /// Retryable. Carries the order id when the order was already persisted.
    #[error("{message}")]
    DependencyUnavailable {
        message: String,
        order_id: Option<OrderId>,
    },

    #[error("{0}")]
    Persistence(String),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::DependencyUnavailable {
            message: msg.into(),
            order_id: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) | ServiceError::InvalidTransition(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::DependencyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::InvalidTransition(_) => "invalid_transition",
            ServiceError::DependencyUnavailable { .. } => "dependency_unavailable",
            ServiceError::Persistence(_) => "persistence_error",
        }
    }
}

impl From<DomainError> for ServiceError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => ServiceError::Validation(msg),
            DomainError::InvalidId(msg) => ServiceError::Validation(format!("invalid identifier: {msg}")),
            DomainError::NotFound => ServiceError::NotFound("not found".to_string()),
            DomainError::Conflict(msg) => ServiceError::Conflict(msg),
            e @ DomainError::WouldUnderflow { .. } => ServiceError::Conflict(e.to_string()),
            DomainError::InvalidTransition(msg) => ServiceError::InvalidTransition(msg),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound => ServiceError::NotFound("not found".to_string()),
            StoreError::AlreadyExists(what) => ServiceError::Conflict(format!("{what} already exists")),
            StoreError::WouldUnderflow { available, delta } => ServiceError::Conflict(format!(
                "insufficient inventory (available: {available}, delta: {delta})"
            )),
            StoreError::StatusConflict { current, .. } => {
                ServiceError::InvalidTransition(format!("order is already {current}"))
            }
            StoreError::Unavailable(msg) => ServiceError::unavailable(msg),
            e @ (StoreError::Invalid(_) | StoreError::Backend(_)) => {
                ServiceError::Persistence(e.to_string())
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        match &self {
            ServiceError::DependencyUnavailable {
                message,
                order_id: Some(order_id),
            } => (
                status,
                axum::Json(json!({
                    "error": self.code(),
                    "message": message,
                    "order_id": order_id,
                })),
            )
                .into_response(),
            _ => json_error(status, self.code(), self.to_string()),
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
