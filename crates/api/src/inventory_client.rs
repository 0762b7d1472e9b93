//! HTTP client the order service uses to reach the inventory service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use orderflow_core::{OrderId, ProductName};
use orderflow_inventory::Product;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InventoryClientError {
    #[error("product not found")]
    NotFound,

    /// The inventory service refused the decrement (409).
    #[error("insufficient inventory: {0}")]
    Insufficient(String),

    #[error("inventory service unavailable: {0}")]
    Unavailable(String),

    #[error("inventory service timed out after {0:?}")]
    Timeout(Duration),
}

impl InventoryClientError {
    /// Whether the call may have failed without the inventory service deciding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InventoryClientError::Unavailable(_) | InventoryClientError::Timeout(_)
        )
    }
}

#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn get_product(&self, name: &ProductName) -> Result<Product, InventoryClientError>;

    /// Decrement `name` by `quantity` on behalf of `order_id`. Safe to repeat.
    async fn apply_order_decrement(
        &self,
        order_id: OrderId,
        name: &ProductName,
        quantity: i64,
    ) -> Result<Product, InventoryClientError>;
}

/// [`InventoryClient`] over the inventory service's REST API.
#[derive(Debug, Clone)]
pub struct HttpInventoryClient {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

impl HttpInventoryClient {
    /// Every request is bounded by `timeout`; an elapsed timeout is an error.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    fn product_url(&self, name: &ProductName) -> Result<Url, InventoryClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                InventoryClientError::Unavailable(format!("invalid base url {}", self.base_url))
            })?
            .pop_if_empty()
            .push("product")
            .push(name.as_str());
        Ok(url)
    }

    fn transport_error(&self, err: reqwest::Error) -> InventoryClientError {
        if err.is_timeout() {
            InventoryClientError::Timeout(self.timeout)
        } else {
            InventoryClientError::Unavailable(err.to_string())
        }
    }

    async fn read_product(
        &self,
        resp: reqwest::Response,
    ) -> Result<Product, InventoryClientError> {
        match resp.status() {
            StatusCode::NOT_FOUND => Err(InventoryClientError::NotFound),
            StatusCode::CONFLICT => {
                let body = resp
                    .json::<ErrorBody>()
                    .await
                    .map(|b| b.message)
                    .unwrap_or_default();
                Err(InventoryClientError::Insufficient(body))
            }
            status if status.is_success() => resp
                .json::<Product>()
                .await
                .map_err(|e| self.transport_error(e)),
            status => Err(InventoryClientError::Unavailable(format!(
                "inventory service returned {status}"
            ))),
        }
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    #[tracing::instrument(skip(self), fields(product = %name), err)]
    async fn get_product(&self, name: &ProductName) -> Result<Product, InventoryClientError> {
        let url = self.product_url(name)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.read_product(resp).await
    }

    #[tracing::instrument(skip(self), fields(order_id = %order_id, product = %name), err)]
    async fn apply_order_decrement(
        &self,
        order_id: OrderId,
        name: &ProductName,
        quantity: i64,
    ) -> Result<Product, InventoryClientError> {
        let url = self.product_url(name)?;
        let resp = self
            .client
            .put(url)
            .json(&json!({ "delta": -quantity, "order_id": order_id }))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.read_product(resp).await
    }
}
