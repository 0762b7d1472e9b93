use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::WorkerHandle;

/// Runs a job on a fixed interval until shut down (outbox relay).
///
/// Ticks that would overlap a still-running job are skipped, so the job never
/// runs concurrently with itself.
#[derive(Debug)]
pub struct PeriodicWorker;

impl PeriodicWorker {
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut job: F) -> WorkerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => job().await,
                }
            }
            tracing::debug!(worker = name, "periodic worker stopped");
        });
        WorkerHandle::new(name, shutdown_tx, join)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn runs_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = PeriodicWorker::spawn("tick", Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;
        let after = runs.load(Ordering::SeqCst);
        assert!(after >= 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after);
    }
}
