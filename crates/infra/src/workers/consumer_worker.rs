use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use orderflow_events::{Delivery, EventHandler, HandlerError, Subscription};

use super::WorkerHandle;

/// Inline attempts for a delivery whose handler asks for a retry before it is
/// left unacknowledged for the broker to redeliver.
const INLINE_ATTEMPTS: u32 = 3;

/// Generic bus consumer loop.
///
/// - Drains one subscription
/// - Runs an idempotent handler for each delivery
/// - Acknowledges on success or on a discarded delivery
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    /// Spawn a task that feeds `subscription` into `handler`.
    ///
    /// `handler` must be idempotent (at-least-once delivery safe).
    pub fn spawn<H>(name: &'static str, subscription: Subscription, handler: Arc<H>) -> WorkerHandle
    where
        H: EventHandler + ?Sized + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(worker_loop(name, subscription, shutdown_rx, handler));
        WorkerHandle::new(name, shutdown_tx, join)
    }
}

async fn worker_loop<H>(
    name: &'static str,
    mut subscription: Subscription,
    mut shutdown_rx: watch::Receiver<bool>,
    handler: Arc<H>,
) where
    H: EventHandler + ?Sized,
{
    loop {
        let delivery = tokio::select! {
            _ = shutdown_rx.changed() => break,
            next = subscription.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };
        process(name, handler.as_ref(), delivery).await;
    }
    debug!(worker = name, topic = %subscription.topic(), "consumer worker stopped");
}

async fn process<H>(name: &'static str, handler: &H, delivery: Delivery)
where
    H: EventHandler + ?Sized,
{
    let mut backoff = Duration::from_millis(50);

    for attempt in 1..=INLINE_ATTEMPTS {
        let envelope = delivery.envelope();
        match handler.handle(envelope).await {
            Ok(()) => break,
            Err(err @ HandlerError::Discard(_)) => {
                warn!(
                    worker = name,
                    event_type = %envelope.event_type(),
                    event_id = %envelope.event_id(),
                    error = %err,
                    "delivery discarded"
                );
                break;
            }
            Err(err) if attempt < INLINE_ATTEMPTS => {
                warn!(
                    worker = name,
                    event_type = %envelope.event_type(),
                    attempt,
                    error = %err,
                    "handler failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => {
                // Left unacknowledged; a durable broker redelivers it later.
                error!(
                    worker = name,
                    event_type = %envelope.event_type(),
                    event_id = %envelope.event_id(),
                    error = %err,
                    "handler failed, leaving delivery unacknowledged"
                );
                return;
            }
        }
    }

    if let Err(e) = delivery.ack().await {
        warn!(worker = name, error = %e, "acknowledging delivery failed");
    }
}
