use async_trait::async_trait;

use crate::envelope::RawEnvelope;

/// Outcome of a failed delivery, deciding whether it is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure (store unreachable, timeout). Leave unacknowledged so
    /// the broker redelivers it.
    #[error("retryable: {0}")]
    Retry(String),

    /// The delivery can never succeed (undecodable payload, unknown event).
    /// Acknowledge it so it does not block the group.
    #[error("discarded: {0}")]
    Discard(String),
}

impl HandlerError {
    pub fn retry(msg: impl Into<String>) -> Self {
        Self::Retry(msg.into())
    }

    pub fn discard(msg: impl Into<String>) -> Self {
        Self::Discard(msg.into())
    }

    pub fn should_ack(&self) -> bool {
        matches!(self, HandlerError::Discard(_))
    }
}

/// Consumes envelopes delivered from one subscription.
///
/// Implementations must be idempotent: the same envelope can arrive more than
/// once, and handling it again must leave state unchanged.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError>;
}
