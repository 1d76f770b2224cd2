//! Periodic cache/store consistency check.
//!
//! A cache-process restart (or a dropped write) leaves the visible cache
//! under-reporting relative to the durable store. This task detects that
//! per queue and re-triggers the Filling → Ok cycle through the same CAS
//! claim the cold-start path uses.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::cache::CacheLayer;
use crate::queue::QueueRegistry;

pub struct ConsistencyCheckTask {
    interval: Duration,
    registry: Arc<QueueRegistry>,
    cache: Arc<CacheLayer>,
    shutdown: broadcast::Receiver<()>,
}

impl ConsistencyCheckTask {
    pub fn new(
        interval_seconds: u64,
        registry: Arc<QueueRegistry>,
        cache: Arc<CacheLayer>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            interval: Duration::from_secs(interval_seconds.max(1)),
            registry,
            cache,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Consistency check task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Consistency check task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    for queue in self.registry.list() {
                        self.cache.check_consistency(&queue.url).await;
                    }
                }
            }
        }

        tracing::info!("Consistency check task stopped");
    }
}
