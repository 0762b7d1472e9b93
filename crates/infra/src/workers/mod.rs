//! Background workers: bus consumers and periodic jobs.

pub mod consumer_worker;
pub mod periodic;

pub use consumer_worker::ConsumerWorker;
pub use periodic::PeriodicWorker;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn new(name: &'static str, shutdown: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self { name, shutdown, join }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::warn!(worker = self.name, error = %e, "worker task ended abnormally");
        }
    }
}
