//! Graceful shutdown handling.
//!
//! Sequence: signal the background tasks, wake every pending long-poll
//! waiter so its call completes with an empty result, then wait briefly
//! for the registries to drain. Pending waiters are never left dangling
//! past process exit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::longpoll::WaitRegistry;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for drained long-polls to complete.
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
        }
    }
}

pub struct GracefulShutdown {
    waiters: Arc<WaitRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(waiters: Arc<WaitRegistry>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            waiters,
            shutdown_tx,
            config: ShutdownConfig::default(),
        }
    }

    pub fn with_config(
        waiters: Arc<WaitRegistry>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            waiters,
            shutdown_tx,
            config,
        }
    }

    /// Execute the shutdown sequence.
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        tracing::info!(reason = %reason, "Starting graceful shutdown");

        // Phase 1: stop background tasks and in-flight long-poll selects
        let _ = self.shutdown_tx.send(());

        // Phase 2: wake everything still registered
        let woken = self.waiters.drain();

        // Phase 3: wait for the suspended calls to finish their final
        // dequeue and return
        let waiters = self.waiters.clone();
        let drain_future = async {
            loop {
                if waiters.total_waiting() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        let drained = timeout(self.config.drain_timeout, drain_future)
            .await
            .is_ok();

        let result = ShutdownResult {
            waiters_woken: woken,
            drained,
            duration: start.elapsed(),
        };
        tracing::info!(
            waiters_woken = result.waiters_woken,
            drained = result.drained,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );
        result
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug)]
pub struct ShutdownResult {
    /// Long-poll waiters woken so their calls could complete
    pub waiters_woken: usize,
    /// Whether the wait registries fully drained in time
    pub drained: bool,
    /// Total time taken
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_with_no_waiters() {
        let waiters = Arc::new(WaitRegistry::new());
        let (tx, _) = broadcast::channel(1);
        let shutdown = GracefulShutdown::new(waiters, tx);

        let result = shutdown.execute("test").await;
        assert_eq!(result.waiters_woken, 0);
        assert!(result.drained);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_registered_waiters() {
        let waiters = Arc::new(WaitRegistry::new());
        let (tx, _) = broadcast::channel(1);

        let mut ticket = waiters.register("arn:hxmq:dc1:123:orders");
        let shutdown = GracefulShutdown::new(waiters.clone(), tx);

        let result = shutdown.execute("test").await;
        assert_eq!(result.waiters_woken, 1);
        assert!(ticket.permit.try_recv().is_ok());
        assert_eq!(waiters.total_waiting(), 0);
    }
}
