//! Revisibility sweeper.
//!
//! One task sweeps every queue on a fixed interval, promoting hidden
//! entries whose deadline has passed back into the visible set. A queue
//! that gained messages gets one local notify so a blocked long-poll can
//! pick them up without waiting for a fresh send.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::cache::CacheLayer;
use crate::longpoll::WaitRegistry;
use crate::metrics::{LongPollMetrics, MESSAGES_PROMOTED_TOTAL};
use crate::queue::QueueRegistry;

pub struct VisibilitySweeper {
    interval: Duration,
    registry: Arc<QueueRegistry>,
    cache: Arc<CacheLayer>,
    waiters: Arc<WaitRegistry>,
    shutdown: broadcast::Receiver<()>,
}

impl VisibilitySweeper {
    pub fn new(
        interval_ms: u64,
        registry: Arc<QueueRegistry>,
        cache: Arc<CacheLayer>,
        waiters: Arc<WaitRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
            registry,
            cache,
            waiters,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Visibility sweeper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Visibility sweeper received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.sweep().await;
                }
            }
        }

        tracing::info!("Visibility sweeper stopped");
    }

    async fn sweep(&self) {
        for queue in self.registry.list() {
            let promoted = self.cache.promote_expired(&queue.url).await;
            if promoted == 0 {
                continue;
            }

            MESSAGES_PROMOTED_TOTAL.inc_by(promoted as u64);
            if self.waiters.notify_one(&queue.arn) {
                LongPollMetrics::record_local_wake();
            }
            tracing::debug!(
                queue = %queue.url,
                promoted = promoted,
                "Promoted expired hidden messages"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryMessageCache;
    use crate::config::QueueDefaults;
    use crate::message::{IdGenerator, Message};
    use crate::queue::QueueInfo;
    use crate::store::{DurableMessageStore, MemoryDurableStore};
    use crate::visibility::VisibilityTracker;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_sweeper_promotes_and_stops() {
        let registry = Arc::new(QueueRegistry::new());
        let queue = registry
            .create(QueueInfo::new(
                "123",
                "orders",
                "dc1",
                &QueueDefaults::default(),
            ))
            .unwrap();

        let store = Arc::new(MemoryDurableStore::new());
        let tracker = Arc::new(VisibilityTracker::new());
        let cache = Arc::new(CacheLayer::new(
            store.clone(),
            Arc::new(MemoryMessageCache::new()),
            tracker.clone(),
            100,
        ));
        let waiters = Arc::new(WaitRegistry::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        // A message hidden with an expired deadline
        let generator = IdGenerator::new("n1");
        let msg = Message::new(
            generator.next(&queue.url, 0, 0),
            "x".to_string(),
            None,
            HashMap::new(),
        );
        store.insert(&queue.url, &msg).await.unwrap();
        tracker.hide(&queue.url, msg, 0);

        let sweeper = VisibilitySweeper::new(
            20,
            registry.clone(),
            cache.clone(),
            waiters.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(sweeper.run());

        // Wait for at least one sweep
        for _ in 0..50 {
            if tracker.hidden_count(&queue.url) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tracker.hidden_count(&queue.url), 0);
        assert_eq!(cache.queue_message_count(&queue.url).await.unwrap(), 1);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("task should stop")
            .expect("task should not panic");
    }
}
