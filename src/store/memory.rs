//! In-memory durable store.
//!
//! A DashMap of per-queue BTreeMaps keyed by id string; BTreeMap range
//! scans give the ordered-scan-from-cursor contract directly. Contention
//! is per queue, matching the locking granularity used everywhere else.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::message::Message;

use super::{DurableMessageStore, StoreError};

pub struct MemoryDurableStore {
    queues: DashMap<String, BTreeMap<String, Message>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }
}

impl Default for MemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableMessageStore for MemoryDurableStore {
    async fn insert(&self, queue_url: &str, message: &Message) -> Result<(), StoreError> {
        self.queues
            .entry(queue_url.to_string())
            .or_default()
            .insert(message.id.to_string(), message.clone());
        Ok(())
    }

    async fn insert_batch(&self, queue_url: &str, messages: &[Message]) -> Result<(), StoreError> {
        let mut queue = self.queues.entry(queue_url.to_string()).or_default();
        for message in messages {
            queue.insert(message.id.to_string(), message.clone());
        }
        Ok(())
    }

    async fn get(&self, queue_url: &str, id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self
            .queues
            .get(queue_url)
            .and_then(|q| q.get(id).cloned()))
    }

    async fn scan(
        &self,
        queue_url: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let Some(queue) = self.queues.get(queue_url) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(cursor) => Bound::Excluded(cursor.to_string()),
            None => Bound::Unbounded,
        };
        Ok(queue
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn delete(&self, queue_url: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .queues
            .get_mut(queue_url)
            .map(|mut q| q.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn count(&self, queue_url: &str) -> Result<usize, StoreError> {
        Ok(self.queues.get(queue_url).map(|q| q.len()).unwrap_or(0))
    }

    async fn purge(&self, queue_url: &str) -> Result<usize, StoreError> {
        Ok(self
            .queues
            .remove(queue_url)
            .map(|(_, q)| q.len())
            .unwrap_or(0))
    }
}
