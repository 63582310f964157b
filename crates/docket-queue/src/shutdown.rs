//! Graceful shutdown: stop dequeuing, drain in-flight jobs, close the broker.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use crate::registry::QueueRegistry;
use crate::worker::WorkerPool;

/// How a shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight job settled within the grace period.
    Drained,
    /// The grace period elapsed; `abandoned` executions were cut off and
    /// their jobs left `Active` in the broker.
    Forced { abandoned: usize },
}

impl ShutdownOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Drained)
    }
}

/// Owns the running worker pools until shutdown.
pub struct ShutdownCoordinator {
    registry: Arc<QueueRegistry>,
    pools: Vec<WorkerPool>,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<QueueRegistry>, pools: Vec<WorkerPool>) -> Self {
        Self { registry, pools }
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    /// Wait for SIGINT or SIGTERM, then shut down.
    pub async fn run_until_signal(self, grace: Duration) -> ShutdownOutcome {
        shutdown_signal().await;
        self.shutdown(grace).await
    }

    /// Stop every queue, wait up to `grace` for in-flight jobs, then close
    /// the broker. Producers may keep enqueueing; those jobs are stored but
    /// not claimed by this process.
    pub async fn shutdown(self, grace: Duration) -> ShutdownOutcome {
        let in_flight: usize = self.pools.iter().map(WorkerPool::in_flight).sum();
        info!(
            queues = self.pools.len(),
            in_flight = in_flight,
            grace_ms = grace.as_millis() as u64,
            "Shutting down worker pools"
        );

        for queue in self.registry.queues() {
            queue.stop();
        }

        let drained = join_all(self.pools.iter().map(|pool| pool.queue().drained()));
        let outcome = match tokio::time::timeout(grace, drained).await {
            Ok(_) => ShutdownOutcome::Drained,
            Err(_) => {
                let mut abandoned = 0;
                for pool in &self.pools {
                    let cut = pool.abort();
                    if cut > 0 {
                        error!(
                            queue = %pool.queue().name(),
                            abandoned = cut,
                            "Lossy shutdown: grace period elapsed, jobs left active for reclaim"
                        );
                    }
                    abandoned += cut;
                }
                ShutdownOutcome::Forced { abandoned }
            }
        };

        for pool in self.pools {
            pool.join().await;
        }

        if let Err(e) = self.registry.close_backend().await {
            warn!(error = %e, "Failed to close queue broker");
        }

        match outcome {
            ShutdownOutcome::Drained => info!("All queues drained, shutdown complete"),
            ShutdownOutcome::Forced { abandoned } => {
                warn!(abandoned = abandoned, "Shutdown forced after grace period")
            }
        }
        outcome
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueue;

    #[test]
    fn test_outcome_is_clean() {
        assert!(ShutdownOutcome::Drained.is_clean());
        assert!(!ShutdownOutcome::Forced { abandoned: 2 }.is_clean());
    }

    #[tokio::test]
    async fn test_shutdown_without_pools_is_drained() {
        let registry = Arc::new(QueueRegistry::new(Arc::new(MemoryQueue::new())));
        let outcome = ShutdownCoordinator::new(registry, Vec::new())
            .shutdown(Duration::from_millis(10))
            .await;
        assert_eq!(outcome, ShutdownOutcome::Drained);
    }
}
