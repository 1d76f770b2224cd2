//! Write-through cache in front of the durable message store.
//!
//! Sends land in the durable store first and then in the cache, so a
//! crash after a send acknowledgment can lose the cache copy but never
//! the message. Reads come from the cache once a queue's fill has
//! completed; while a fill is running (or the cache is misbehaving)
//! reads fall back to the durable store so callers never observe fewer
//! messages than are durably present.

mod backend;
mod factory;
mod memory_backend;
mod redis_backend;
mod state;

pub use backend::{CacheError, MessageCache};
pub use factory::create_message_cache;
pub use memory_backend::MemoryMessageCache;
pub use redis_backend::RedisMessageCache;
pub use state::{CacheState, QueueCacheState};

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;
use crate::message::Message;
use crate::metrics::CacheMetrics;
use crate::store::DurableMessageStore;
use crate::visibility::VisibilityTracker;

/// What prompted a fill, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillTrigger {
    ColdStart,
    ConsistencyCheck,
}

pub struct CacheLayer {
    store: Arc<dyn DurableMessageStore>,
    cache: Arc<dyn MessageCache>,
    tracker: Arc<VisibilityTracker>,
    states: DashMap<String, Arc<QueueCacheState>>,
    fill_page_size: usize,
}

impl CacheLayer {
    pub fn new(
        store: Arc<dyn DurableMessageStore>,
        cache: Arc<dyn MessageCache>,
        tracker: Arc<VisibilityTracker>,
        fill_page_size: usize,
    ) -> Self {
        Self {
            store,
            cache,
            tracker,
            states: DashMap::new(),
            fill_page_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableMessageStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<VisibilityTracker> {
        &self.tracker
    }

    pub fn cache_state(&self, queue_url: &str) -> CacheState {
        self.state_for(queue_url).state()
    }

    fn state_for(&self, queue_url: &str) -> Arc<QueueCacheState> {
        self.states
            .entry(queue_url.to_string())
            .or_insert_with(|| Arc::new(QueueCacheState::new()))
            .clone()
    }

    /// First cache access for a queue claims the Uninitialized→Filling
    /// transition and starts the background copy. Exactly one caller
    /// wins the CAS.
    fn ensure_fill_started(&self, queue_url: &str) {
        let state = self.state_for(queue_url);
        if state.claim_fill() {
            CacheMetrics::record_fill_cold_start();
            self.spawn_fill(queue_url, state, FillTrigger::ColdStart);
        }
    }

    /// Restart the fill after the consistency check caught the cache
    /// under-reporting. No-op unless the queue is currently Ok.
    pub fn trigger_refill(&self, queue_url: &str) -> bool {
        let state = self.state_for(queue_url);
        if state.claim_refill() {
            CacheMetrics::record_fill_consistency();
            self.spawn_fill(queue_url, state, FillTrigger::ConsistencyCheck);
            true
        } else {
            false
        }
    }

    fn spawn_fill(&self, queue_url: &str, state: Arc<QueueCacheState>, trigger: FillTrigger) {
        let store = self.store.clone();
        let cache = self.cache.clone();
        let tracker = self.tracker.clone();
        let queue_url = queue_url.to_string();
        let page_size = self.fill_page_size;
        tokio::spawn(async move {
            run_fill(queue_url, store, cache, tracker, state, page_size, trigger).await;
        });
    }

    /// Write-through send. Success requires the durable write; a cache
    /// write failure is logged and left to the consistency check.
    pub async fn send_message(&self, queue_url: &str, message: Message, delay_seconds: u32) -> Result<()> {
        self.ensure_fill_started(queue_url);

        self.store.insert(queue_url, &message).await?;

        if delay_seconds > 0 {
            // Delayed messages start hidden and surface via the sweeper
            self.tracker.hide(queue_url, message, delay_seconds);
            return Ok(());
        }

        if let Err(e) = self.cache.put_visible(queue_url, &message).await {
            CacheMetrics::record_write_failure();
            tracing::warn!(
                queue = %queue_url,
                error = %e,
                "Cache write failed after durable write, serving degraded until repaired"
            );
        }
        Ok(())
    }

    /// Batch write-through send. The durable batch insert gates success
    /// for every entry.
    pub async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<(Message, u32)>,
    ) -> Result<()> {
        self.ensure_fill_started(queue_url);

        let messages: Vec<Message> = entries.iter().map(|(m, _)| m.clone()).collect();
        self.store.insert_batch(queue_url, &messages).await?;

        let mut visible = Vec::new();
        for (message, delay_seconds) in entries {
            if delay_seconds > 0 {
                self.tracker.hide(queue_url, message, delay_seconds);
            } else {
                visible.push(message);
            }
        }

        if !visible.is_empty() {
            if let Err(e) = self.cache.put_visible_many(queue_url, &visible).await {
                CacheMetrics::record_write_failure();
                tracing::warn!(
                    queue = %queue_url,
                    error = %e,
                    "Cache batch write failed after durable write"
                );
            }
        }
        Ok(())
    }

    /// Pop up to `max` visible messages and hide each for
    /// `visibility_timeout` seconds. A timeout of zero re-delivers on
    /// every call: the receive still counts, but the message never
    /// leaves the visible set.
    pub async fn receive_message(
        &self,
        queue_url: &str,
        max: usize,
        visibility_timeout: u32,
    ) -> Result<Vec<Message>> {
        self.ensure_fill_started(queue_url);

        let state = self.cache_state(queue_url);
        let mut popped = if state == CacheState::Ok {
            match self.cache.pop_visible(queue_url, max).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(
                        queue = %queue_url,
                        error = %e,
                        "Cache pop failed, serving from durable store"
                    );
                    CacheMetrics::record_bypass_read();
                    self.receive_from_store(queue_url, max).await?
                }
            }
        } else {
            // Reads during Filling go to the durable store so a
            // partially-filled cache never under-reports
            CacheMetrics::record_bypass_read();
            self.receive_from_store(queue_url, max).await?
        };

        for message in &mut popped {
            message.attributes.record_receive();
        }

        if visibility_timeout == 0 {
            if !popped.is_empty() {
                // Keep the updated receive counts in the visible copy
                if let Err(e) = self.cache.put_visible_many(queue_url, &popped).await {
                    CacheMetrics::record_write_failure();
                    tracing::warn!(queue = %queue_url, error = %e, "Cache re-insert failed");
                }
            }
        } else {
            for message in popped.clone() {
                self.tracker.hide(queue_url, message, visibility_timeout);
            }
        }

        Ok(popped)
    }

    /// Store-direct receive path used while Filling or degraded: scan
    /// the durable store in id order and skip everything hidden.
    async fn receive_from_store(&self, queue_url: &str, max: usize) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        let page_size = self.fill_page_size.max(max);

        while out.len() < max {
            let page = self
                .store
                .scan(queue_url, cursor.as_deref(), page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|m| m.id.to_string());

            for message in page {
                let id = message.id.to_string();
                if self.tracker.is_hidden(queue_url, &id) {
                    continue;
                }
                // Drop the cache copy so a completed fill cannot
                // re-deliver what we are about to hide
                let _ = self.cache.remove(queue_url, &id).await;
                out.push(message);
                if out.len() == max {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Delete by id (receipt-handle lookup key). Idempotent: removing a
    /// message that is already gone reports false but never errors.
    pub async fn delete_message(&self, queue_url: &str, id: &str) -> Result<bool> {
        let was_hidden = self.tracker.remove(queue_url, id).is_some();
        let was_stored = self.store.delete(queue_url, id).await?;
        if let Err(e) = self.cache.remove(queue_url, id).await {
            tracing::warn!(queue = %queue_url, error = %e, "Cache delete failed");
        }
        Ok(was_hidden || was_stored)
    }

    /// Rewrite the revisible-at deadline of a hidden message. A timeout
    /// of zero promotes it immediately. Returns false when the id does
    /// not name a currently-hidden message.
    pub async fn change_message_visibility(
        &self,
        queue_url: &str,
        id: &str,
        visibility_timeout: u32,
    ) -> Result<bool> {
        if visibility_timeout == 0 {
            match self.tracker.remove(queue_url, id) {
                Some(entry) => {
                    if let Err(e) = self.cache.put_visible(queue_url, &entry.message).await {
                        CacheMetrics::record_write_failure();
                        tracing::warn!(
                            queue = %queue_url,
                            error = %e,
                            "Cache re-insert failed during visibility change"
                        );
                    }
                    Ok(true)
                }
                None => Ok(false),
            }
        } else {
            Ok(self
                .tracker
                .change_visibility(queue_url, id, visibility_timeout))
        }
    }

    /// Promote already-expired hidden messages back into the visible
    /// set. Called by the sweeper; returns how many were promoted.
    pub async fn promote_expired(&self, queue_url: &str) -> usize {
        let promoted = self.tracker.take_expired(queue_url, chrono::Utc::now());
        if promoted.is_empty() {
            return 0;
        }
        let count = promoted.len();
        if let Err(e) = self.cache.put_visible_many(queue_url, &promoted).await {
            CacheMetrics::record_write_failure();
            tracing::warn!(
                queue = %queue_url,
                error = %e,
                promoted = count,
                "Cache re-insert failed during promotion"
            );
        }
        count
    }

    /// Non-destructive ordered scan for admin inspection. Served from
    /// the durable store, which is authoritative regardless of fill
    /// state; the cursor is the last id of the previous page.
    pub async fn peek_queue(
        &self,
        queue_url: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        Ok(self.store.scan(queue_url, cursor, limit).await?)
    }

    /// Remove every message, visible and hidden.
    pub async fn clear_queue(&self, queue_url: &str) -> Result<usize> {
        let purged = self.store.purge(queue_url).await?;
        self.tracker.clear(queue_url);
        if let Err(e) = self.cache.clear(queue_url).await {
            tracing::warn!(queue = %queue_url, error = %e, "Cache clear failed");
        }
        Ok(purged)
    }

    /// Approximate number of visible messages.
    pub async fn queue_message_count(&self, queue_url: &str) -> Result<usize> {
        self.ensure_fill_started(queue_url);
        if self.cache_state(queue_url) == CacheState::Ok {
            match self.cache.visible_count(queue_url).await {
                Ok(count) => return Ok(count),
                Err(e) => {
                    tracing::warn!(queue = %queue_url, error = %e, "Cache count failed");
                }
            }
        }
        let stored = self.store.count(queue_url).await?;
        Ok(stored.saturating_sub(self.tracker.hidden_count(queue_url)))
    }

    /// Ids at the head of the visible set, oldest first.
    pub async fn ids_from_head(&self, queue_url: &str, limit: usize) -> Result<Vec<String>> {
        self.ensure_fill_started(queue_url);
        if self.cache_state(queue_url) == CacheState::Ok {
            match self.cache.ids_from_head(queue_url, limit).await {
                Ok(ids) => return Ok(ids),
                Err(e) => {
                    tracing::warn!(queue = %queue_url, error = %e, "Cache head scan failed");
                }
            }
        }
        let messages = self.receive_candidates_preview(queue_url, limit).await?;
        Ok(messages)
    }

    async fn receive_candidates_preview(
        &self,
        queue_url: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        while out.len() < limit {
            let page = self
                .store
                .scan(queue_url, cursor.as_deref(), self.fill_page_size.max(limit))
                .await?;
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|m| m.id.to_string());
            for message in page {
                let id = message.id.to_string();
                if !self.tracker.is_hidden(queue_url, &id) {
                    out.push(id);
                    if out.len() == limit {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Cache/store agreement check for one queue. Returns true when the
    /// cache can keep serving reads.
    pub async fn check_consistency(&self, queue_url: &str) -> bool {
        if self.cache_state(queue_url) != CacheState::Ok {
            // A fill is already running or pending
            return true;
        }

        let expected = match self.store.count(queue_url).await {
            Ok(stored) => stored.saturating_sub(self.tracker.hidden_count(queue_url)),
            Err(e) => {
                tracing::warn!(queue = %queue_url, error = %e, "Store count failed during consistency check");
                return true;
            }
        };

        match self.cache.visible_count(queue_url).await {
            Ok(cached) if cached >= expected => true,
            Ok(cached) => {
                tracing::warn!(
                    queue = %queue_url,
                    cached = cached,
                    expected = expected,
                    "Cache under-reporting, restarting fill"
                );
                self.trigger_refill(queue_url)
            }
            Err(e) => {
                tracing::warn!(
                    queue = %queue_url,
                    error = %e,
                    "Cache unreachable during consistency check, restarting fill"
                );
                self.trigger_refill(queue_url)
            }
        }
    }
}

/// Background copy of a queue's durable contents into the cache.
async fn run_fill(
    queue_url: String,
    store: Arc<dyn DurableMessageStore>,
    cache: Arc<dyn MessageCache>,
    tracker: Arc<VisibilityTracker>,
    state: Arc<QueueCacheState>,
    page_size: usize,
    trigger: FillTrigger,
) {
    tracing::info!(queue = %queue_url, ?trigger, "Cache fill started");

    let mut cursor: Option<String> = None;
    let mut copied = 0usize;

    loop {
        let page = match store.scan(&queue_url, cursor.as_deref(), page_size).await {
            Ok(page) => page,
            Err(e) => {
                tracing::error!(queue = %queue_url, error = %e, "Store scan failed, aborting fill");
                state.abort_fill();
                return;
            }
        };
        if page.is_empty() {
            break;
        }
        cursor = page.last().map(|m| m.id.to_string());

        let visible: Vec<Message> = page
            .into_iter()
            .filter(|m| !tracker.is_hidden(&queue_url, &m.id.to_string()))
            .collect();
        if visible.is_empty() {
            continue;
        }

        if let Err(e) = cache.put_visible_many(&queue_url, &visible).await {
            tracing::error!(queue = %queue_url, error = %e, "Cache write failed, aborting fill");
            state.abort_fill();
            return;
        }
        // A concurrent receive may have hidden an entry between the scan
        // and the write; pull those back out of the visible set
        for message in &visible {
            let id = message.id.to_string();
            if tracker.is_hidden(&queue_url, &id) {
                let _ = cache.remove(&queue_url, &id).await;
            }
        }
        copied += visible.len();
    }

    state.complete_fill();
    tracing::info!(queue = %queue_url, copied = copied, "Cache fill complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IdGenerator;
    use crate::store::MemoryDurableStore;
    use std::collections::HashMap;
    use std::time::Duration;

    const QUEUE: &str = "/123/orders";

    fn layer() -> (CacheLayer, IdGenerator) {
        let store = Arc::new(MemoryDurableStore::new());
        let cache = Arc::new(MemoryMessageCache::new());
        let tracker = Arc::new(VisibilityTracker::new());
        (
            CacheLayer::new(store, cache, tracker, 100),
            IdGenerator::new("n1"),
        )
    }

    fn message(generator: &IdGenerator, body: &str) -> Message {
        Message::new(
            generator.next(QUEUE, 0, 0),
            body.to_string(),
            None,
            HashMap::new(),
        )
    }

    async fn wait_for_ok(layer: &CacheLayer, queue_url: &str) {
        for _ in 0..100 {
            if layer.cache_state(queue_url) == CacheState::Ok {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fill did not complete");
    }

    #[tokio::test]
    async fn test_send_then_receive_round_trip() {
        let (layer, generator) = layer();
        layer
            .send_message(QUEUE, message(&generator, "hello"), 0)
            .await
            .unwrap();

        let received = layer.receive_message(QUEUE, 1, 30).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "hello");
        assert_eq!(received[0].attributes.approximate_receive_count, 1);
    }

    #[tokio::test]
    async fn test_received_message_is_hidden() {
        let (layer, generator) = layer();
        layer
            .send_message(QUEUE, message(&generator, "x"), 0)
            .await
            .unwrap();

        let first = layer.receive_message(QUEUE, 1, 30).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = layer.receive_message(QUEUE, 1, 30).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(layer.tracker().hidden_count(QUEUE), 1);
    }

    #[tokio::test]
    async fn test_zero_visibility_timeout_redelivers() {
        let (layer, generator) = layer();
        layer
            .send_message(QUEUE, message(&generator, "x"), 0)
            .await
            .unwrap();
        wait_for_ok(&layer, QUEUE).await;

        let first = layer.receive_message(QUEUE, 1, 0).await.unwrap();
        assert_eq!(first[0].attributes.approximate_receive_count, 1);

        let second = layer.receive_message(QUEUE, 1, 0).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attributes.approximate_receive_count, 2);
        assert_eq!(layer.tracker().hidden_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn test_delete_message_is_idempotent() {
        let (layer, generator) = layer();
        layer
            .send_message(QUEUE, message(&generator, "x"), 0)
            .await
            .unwrap();

        let received = layer.receive_message(QUEUE, 1, 30).await.unwrap();
        let handle = received[0].receipt_handle();

        assert!(layer.delete_message(QUEUE, &handle).await.unwrap());
        assert!(!layer.delete_message(QUEUE, &handle).await.unwrap());
        assert_eq!(layer.queue_message_count(QUEUE).await.unwrap(), 0);

        // A deleted message never resurrects
        assert_eq!(layer.promote_expired(QUEUE).await, 0);
        assert!(layer.receive_message(QUEUE, 1, 30).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_visibility_zero_promotes_immediately() {
        let (layer, generator) = layer();
        layer
            .send_message(QUEUE, message(&generator, "x"), 0)
            .await
            .unwrap();

        let received = layer.receive_message(QUEUE, 1, 60).await.unwrap();
        let handle = received[0].receipt_handle();

        assert!(layer
            .change_message_visibility(QUEUE, &handle, 0)
            .await
            .unwrap());

        let again = layer.receive_message(QUEUE, 1, 60).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attributes.approximate_receive_count, 2);
    }

    #[tokio::test]
    async fn test_change_visibility_invalid_handle() {
        let (layer, _) = layer();
        assert!(!layer
            .change_message_visibility(QUEUE, "missing", 30)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delayed_send_starts_hidden() {
        let (layer, generator) = layer();
        layer
            .send_message(QUEUE, message(&generator, "later"), 60)
            .await
            .unwrap();

        assert!(layer.receive_message(QUEUE, 1, 30).await.unwrap().is_empty());
        assert_eq!(layer.tracker().hidden_count(QUEUE), 1);
    }

    #[tokio::test]
    async fn test_promotion_returns_message_with_attributes() {
        let (layer, generator) = layer();
        layer
            .send_message(QUEUE, message(&generator, "x"), 0)
            .await
            .unwrap();
        wait_for_ok(&layer, QUEUE).await;

        // Hide with an already-expired deadline, then promote
        let received = layer.receive_message(QUEUE, 1, 0).await.unwrap();
        layer.tracker().hide(QUEUE, received[0].clone(), 0);
        let _ = layer
            .cache
            .remove(QUEUE, &received[0].id.to_string())
            .await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(layer.promote_expired(QUEUE).await, 1);

        let again = layer.receive_message(QUEUE, 1, 30).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attributes.approximate_receive_count, 2);
    }

    #[tokio::test]
    async fn test_fill_copies_preexisting_messages() {
        // Simulate a cold start against a store that already has data
        let store = Arc::new(MemoryDurableStore::new());
        let generator = IdGenerator::new("n1");
        for i in 0..25 {
            let msg = Message::new(
                generator.next(QUEUE, 0, 0),
                format!("m{}", i),
                None,
                HashMap::new(),
            );
            store.insert(QUEUE, &msg).await.unwrap();
        }

        let cache = Arc::new(MemoryMessageCache::new());
        let tracker = Arc::new(VisibilityTracker::new());
        let layer = CacheLayer::new(store, cache, tracker, 10);

        // Reads during Filling are served from the store and never
        // under-report
        let count = layer.queue_message_count(QUEUE).await.unwrap();
        assert_eq!(count, 25);

        wait_for_ok(&layer, QUEUE).await;
        assert_eq!(layer.queue_message_count(QUEUE).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_consistency_check_triggers_refill() {
        let (layer, generator) = layer();
        layer
            .send_message(QUEUE, message(&generator, "x"), 0)
            .await
            .unwrap();
        wait_for_ok(&layer, QUEUE).await;

        // Simulate a cache restart losing the visible copy
        layer.cache.clear(QUEUE).await.unwrap();
        layer.check_consistency(QUEUE).await;
        wait_for_ok(&layer, QUEUE).await;

        assert_eq!(layer.queue_message_count(QUEUE).await.unwrap(), 1);
        let received = layer.receive_message(QUEUE, 1, 30).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "x");
    }

    #[tokio::test]
    async fn test_clear_queue_removes_everything() {
        let (layer, generator) = layer();
        layer
            .send_message(QUEUE, message(&generator, "a"), 0)
            .await
            .unwrap();
        layer
            .send_message(QUEUE, message(&generator, "b"), 0)
            .await
            .unwrap();
        let _ = layer.receive_message(QUEUE, 1, 30).await.unwrap();

        let purged = layer.clear_queue(QUEUE).await.unwrap();
        assert_eq!(purged, 2);
        assert_eq!(layer.queue_message_count(QUEUE).await.unwrap(), 0);
        assert_eq!(layer.tracker().hidden_count(QUEUE), 0);
    }
}
