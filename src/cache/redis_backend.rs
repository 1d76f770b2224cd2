//! Redis cache backend.
//!
//! Each queue keeps a ZSET of visible message ids scored by send
//! timestamp plus a HASH of id to message JSON:
//! `{prefix}:{queueHash}:visible` / `{prefix}:{queueHash}:data`.
//! The id member set makes every write idempotent, which the fill
//! protocol relies on.

use std::sync::Arc;

use async_trait::async_trait;

use crate::message::{queue_hash, Message};
use crate::redis::pool::{RedisPool, RedisPoolExt};

use super::{CacheError, MessageCache};

pub struct RedisMessageCache {
    pool: Arc<RedisPool>,
    prefix: String,
}

impl RedisMessageCache {
    pub fn new(pool: Arc<RedisPool>, prefix: String) -> Self {
        Self { pool, prefix }
    }

    fn visible_key(&self, queue_url: &str) -> String {
        format!("{}:{}:visible", self.prefix, queue_hash(queue_url))
    }

    fn data_key(&self, queue_url: &str) -> String {
        format!("{}:{}:data", self.prefix, queue_hash(queue_url))
    }

    fn score(message: &Message) -> f64 {
        message.attributes.sent_timestamp_ms as f64
    }
}

#[async_trait]
impl MessageCache for RedisMessageCache {
    fn backend_type(&self) -> &'static str {
        "redis"
    }

    async fn put_visible(&self, queue_url: &str, message: &Message) -> Result<(), CacheError> {
        self.put_visible_many(queue_url, std::slice::from_ref(message))
            .await
    }

    async fn put_visible_many(
        &self,
        queue_url: &str,
        messages: &[Message],
    ) -> Result<(), CacheError> {
        if messages.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = messages.iter().map(|m| m.id.to_string()).collect();
        let payloads: Vec<String> = messages
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<_, _>>()?;

        let fields: Vec<(&str, &str)> = ids
            .iter()
            .map(String::as_str)
            .zip(payloads.iter().map(String::as_str))
            .collect();
        self.pool
            .hset_multiple(&self.data_key(queue_url), &fields)
            .await?;

        let members: Vec<(f64, &str)> = messages
            .iter()
            .zip(ids.iter())
            .map(|(m, id)| (Self::score(m), id.as_str()))
            .collect();
        self.pool
            .zadd_multiple(&self.visible_key(queue_url), &members)
            .await?;

        Ok(())
    }

    async fn pop_visible(&self, queue_url: &str, max: usize) -> Result<Vec<Message>, CacheError> {
        let ids = self.pool.zpopmin(&self.visible_key(queue_url), max).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let data_key = self.data_key(queue_url);
        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.pool.hget(&data_key, id).await? {
                Some(json) => match serde_json::from_str::<Message>(&json) {
                    Ok(message) => messages.push(message),
                    Err(e) => {
                        tracing::warn!(
                            id = %id,
                            error = %e,
                            "Dropping undecodable cached message"
                        );
                    }
                },
                None => {
                    tracing::warn!(id = %id, "Visible index entry had no message body");
                }
            }
        }

        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        self.pool.hdel_fields(&data_key, &id_refs).await?;

        Ok(messages)
    }

    async fn remove(&self, queue_url: &str, id: &str) -> Result<bool, CacheError> {
        let removed = self.pool.zrem(&self.visible_key(queue_url), id).await?;
        self.pool
            .hdel_fields(&self.data_key(queue_url), &[id])
            .await?;
        Ok(removed)
    }

    async fn visible_count(&self, queue_url: &str) -> Result<usize, CacheError> {
        Ok(self.pool.zcard(&self.visible_key(queue_url)).await?)
    }

    async fn ids_from_head(
        &self,
        queue_url: &str,
        limit: usize,
    ) -> Result<Vec<String>, CacheError> {
        Ok(self
            .pool
            .zrange_head(&self.visible_key(queue_url), limit)
            .await?)
    }

    async fn clear(&self, queue_url: &str) -> Result<usize, CacheError> {
        let count = self.pool.zcard(&self.visible_key(queue_url)).await?;
        self.pool
            .del_keys(&[
                self.visible_key(queue_url).as_str(),
                self.data_key(queue_url).as_str(),
            ])
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::redis::{CircuitBreaker, RedisHealth};

    fn create_backend() -> RedisMessageCache {
        let pool = Arc::new(
            RedisPool::new(
                RedisConfig::default(),
                Arc::new(CircuitBreaker::new()),
                Arc::new(RedisHealth::new()),
            )
            .unwrap(),
        );
        RedisMessageCache::new(pool, "hxmq:cache".to_string())
    }

    #[test]
    fn test_key_layout() {
        let backend = create_backend();
        let visible = backend.visible_key("/123/orders");
        let data = backend.data_key("/123/orders");

        assert!(visible.starts_with("hxmq:cache:"));
        assert!(visible.ends_with(":visible"));
        assert!(data.ends_with(":data"));
        // Same queue component for both keys
        assert_eq!(
            visible.trim_end_matches(":visible"),
            data.trim_end_matches(":data")
        );
        // Different queues get different key roots
        assert_ne!(visible, backend.visible_key("/123/other"));
    }
}
