//! In-memory cache backend.
//!
//! Per-queue BTreeMaps keyed by id string. Id strings sort
//! partition-major then time-ascending, so popping the first entries
//! yields the per-partition delivery order the service promises.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::message::Message;

use super::{CacheError, MessageCache};

pub struct MemoryMessageCache {
    queues: DashMap<String, BTreeMap<String, Message>>,
}

impl MemoryMessageCache {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }
}

impl Default for MemoryMessageCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageCache for MemoryMessageCache {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn put_visible(&self, queue_url: &str, message: &Message) -> Result<(), CacheError> {
        self.queues
            .entry(queue_url.to_string())
            .or_default()
            .insert(message.id.to_string(), message.clone());
        Ok(())
    }

    async fn put_visible_many(
        &self,
        queue_url: &str,
        messages: &[Message],
    ) -> Result<(), CacheError> {
        let mut queue = self.queues.entry(queue_url.to_string()).or_default();
        for message in messages {
            queue.insert(message.id.to_string(), message.clone());
        }
        Ok(())
    }

    async fn pop_visible(&self, queue_url: &str, max: usize) -> Result<Vec<Message>, CacheError> {
        let Some(mut queue) = self.queues.get_mut(queue_url) else {
            return Ok(Vec::new());
        };
        let mut popped = Vec::with_capacity(max.min(queue.len()));
        while popped.len() < max {
            match queue.pop_first() {
                Some((_, message)) => popped.push(message),
                None => break,
            }
        }
        Ok(popped)
    }

    async fn remove(&self, queue_url: &str, id: &str) -> Result<bool, CacheError> {
        Ok(self
            .queues
            .get_mut(queue_url)
            .map(|mut q| q.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn visible_count(&self, queue_url: &str) -> Result<usize, CacheError> {
        Ok(self.queues.get(queue_url).map(|q| q.len()).unwrap_or(0))
    }

    async fn ids_from_head(
        &self,
        queue_url: &str,
        limit: usize,
    ) -> Result<Vec<String>, CacheError> {
        Ok(self
            .queues
            .get(queue_url)
            .map(|q| q.keys().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, queue_url: &str) -> Result<usize, CacheError> {
        Ok(self
            .queues
            .remove(queue_url)
            .map(|(_, q)| q.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IdGenerator;
    use std::collections::HashMap;

    const QUEUE: &str = "/123/orders";

    fn messages(n: usize) -> Vec<Message> {
        let generator = IdGenerator::new("n1");
        (0..n)
            .map(|i| {
                Message::new(
                    generator.next(QUEUE, 0, 0),
                    format!("m{}", i),
                    None,
                    HashMap::new(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pop_in_id_order() {
        let cache = MemoryMessageCache::new();
        let msgs = messages(3);
        // Insert out of order
        cache.put_visible(QUEUE, &msgs[2]).await.unwrap();
        cache.put_visible(QUEUE, &msgs[0]).await.unwrap();
        cache.put_visible(QUEUE, &msgs[1]).await.unwrap();

        let popped = cache.pop_visible(QUEUE, 2).await.unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(popped[0].body, "m0");
        assert_eq!(popped[1].body, "m1");
        assert_eq!(cache.visible_count(QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_put_is_idempotent_by_id() {
        let cache = MemoryMessageCache::new();
        let msgs = messages(1);
        cache.put_visible(QUEUE, &msgs[0]).await.unwrap();
        cache.put_visible(QUEUE, &msgs[0]).await.unwrap();
        assert_eq!(cache.visible_count(QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let cache = MemoryMessageCache::new();
        let msgs = messages(2);
        cache.put_visible_many(QUEUE, &msgs).await.unwrap();

        assert!(cache.remove(QUEUE, &msgs[0].id.to_string()).await.unwrap());
        assert!(!cache.remove(QUEUE, &msgs[0].id.to_string()).await.unwrap());
        assert_eq!(cache.clear(QUEUE).await.unwrap(), 1);
        assert_eq!(cache.visible_count(QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ids_from_head() {
        let cache = MemoryMessageCache::new();
        let msgs = messages(3);
        cache.put_visible_many(QUEUE, &msgs).await.unwrap();

        let ids = cache.ids_from_head(QUEUE, 2).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], msgs[0].id.to_string());
        // Non-destructive
        assert_eq!(cache.visible_count(QUEUE).await.unwrap(), 3);
    }
}
