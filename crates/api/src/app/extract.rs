//! Extractors whose rejections use the service's JSON error body.
//!
//! Axum's own `Json`/`Path` reject with `text/plain` and, for a body that
//! parses but does not match the DTO, a 422. Both become `validation_error`
//! (400) here.

use axum::async_trait;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Request};
use axum::http::request::Parts;
use axum::Json;
use serde::de::DeserializeOwned;

use crate::app::errors::ServiceError;

/// Drop-in replacement for `Json<T>` on request bodies.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection: JsonRejection| ServiceError::validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// Drop-in replacement for `Path<T>`.
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection: PathRejection| ServiceError::validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}
