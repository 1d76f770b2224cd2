//! Queue identity, attributes, and the process-wide registry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::QueueDefaults;
use crate::error::QueueServiceError;

/// Immutable identity plus mutable attributes of a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    /// Owner-scoped relative URL, e.g. `/123456789012/orders`.
    pub url: String,
    pub arn: String,
    pub owner: String,
    pub name: String,
    pub visibility_timeout_seconds: u32,
    pub max_message_bytes: usize,
    pub retention_seconds: u64,
    pub delay_seconds: u32,
    pub receive_wait_seconds: u32,
    pub shards: u32,
    pub partitions_per_shard: u32,
    /// Access policy document; evaluated by the policy layer, opaque here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Attribute changes applied by the admin update operation. Identity
/// fields (url/arn/owner/name/sharding) are not updatable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueAttributeUpdate {
    pub visibility_timeout_seconds: Option<u32>,
    pub max_message_bytes: Option<usize>,
    pub retention_seconds: Option<u64>,
    pub delay_seconds: Option<u32>,
    pub receive_wait_seconds: Option<u32>,
    pub policy: Option<serde_json::Value>,
}

impl QueueInfo {
    pub fn new(owner: &str, name: &str, datacenter: &str, defaults: &QueueDefaults) -> Self {
        let url = format!("/{}/{}", owner, name);
        Self {
            arn: format!("arn:hxmq:{}:{}:{}", datacenter, owner, name),
            url,
            owner: owner.to_string(),
            name: name.to_string(),
            visibility_timeout_seconds: defaults.visibility_timeout_seconds,
            max_message_bytes: defaults.max_message_bytes,
            retention_seconds: defaults.retention_seconds,
            delay_seconds: defaults.delay_seconds,
            receive_wait_seconds: defaults.receive_wait_seconds,
            shards: defaults.shards,
            partitions_per_shard: defaults.partitions_per_shard,
            policy: None,
            created_at: Utc::now(),
        }
    }

    fn apply(&mut self, update: &QueueAttributeUpdate) {
        if let Some(v) = update.visibility_timeout_seconds {
            self.visibility_timeout_seconds = v;
        }
        if let Some(v) = update.max_message_bytes {
            self.max_message_bytes = v;
        }
        if let Some(v) = update.retention_seconds {
            self.retention_seconds = v;
        }
        if let Some(v) = update.delay_seconds {
            self.delay_seconds = v;
        }
        if let Some(v) = update.receive_wait_seconds {
            self.receive_wait_seconds = v;
        }
        if let Some(v) = &update.policy {
            self.policy = Some(v.clone());
        }
    }
}

/// Process-wide queue registry keyed by URL, with an ARN index for the
/// long-poll coordinator. Explicitly constructed and torn down with the
/// service; never ambient global state.
pub struct QueueRegistry {
    by_url: DashMap<String, Arc<QueueInfo>>,
    url_by_arn: DashMap<String, String>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self {
            by_url: DashMap::new(),
            url_by_arn: DashMap::new(),
        }
    }

    pub fn create(&self, info: QueueInfo) -> Result<Arc<QueueInfo>, QueueServiceError> {
        let info = Arc::new(info);
        let url = info.url.clone();
        match self.by_url.entry(url) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                // Re-creating an existing queue is idempotent, matching
                // SQS semantics for CreateQueue with identical attributes.
                Ok(existing.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.url_by_arn.insert(info.arn.clone(), info.url.clone());
                slot.insert(info.clone());
                tracing::info!(queue = %info.url, arn = %info.arn, "Queue created");
                Ok(info)
            }
        }
    }

    pub fn get(&self, url: &str) -> Result<Arc<QueueInfo>, QueueServiceError> {
        self.by_url
            .get(url)
            .map(|r| r.value().clone())
            .ok_or_else(|| QueueServiceError::NotFound(format!("queue {}", url)))
    }

    pub fn get_by_arn(&self, arn: &str) -> Option<Arc<QueueInfo>> {
        let url = self.url_by_arn.get(arn)?.value().clone();
        self.by_url.get(&url).map(|r| r.value().clone())
    }

    pub fn update(
        &self,
        url: &str,
        update: &QueueAttributeUpdate,
    ) -> Result<Arc<QueueInfo>, QueueServiceError> {
        let mut entry = self
            .by_url
            .get_mut(url)
            .ok_or_else(|| QueueServiceError::NotFound(format!("queue {}", url)))?;
        let mut updated = (**entry.value()).clone();
        updated.apply(update);
        let updated = Arc::new(updated);
        *entry.value_mut() = updated.clone();
        Ok(updated)
    }

    /// Remove the queue record. The service purges messages first.
    pub fn remove(&self, url: &str) -> Result<Arc<QueueInfo>, QueueServiceError> {
        let (_, info) = self
            .by_url
            .remove(url)
            .ok_or_else(|| QueueServiceError::NotFound(format!("queue {}", url)))?;
        self.url_by_arn.remove(&info.arn);
        tracing::info!(queue = %info.url, "Queue deleted");
        Ok(info)
    }

    pub fn list(&self) -> Vec<Arc<QueueInfo>> {
        let mut queues: Vec<_> = self.by_url.iter().map(|r| r.value().clone()).collect();
        queues.sort_by(|a, b| a.url.cmp(&b.url));
        queues
    }

    pub fn len(&self) -> usize {
        self.by_url.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_url.is_empty()
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_queue(name: &str) -> QueueInfo {
        QueueInfo::new("123456789012", name, "dc1", &QueueDefaults::default())
    }

    #[test]
    fn test_create_and_get() {
        let registry = QueueRegistry::new();
        let info = registry.create(test_queue("orders")).unwrap();
        assert_eq!(info.url, "/123456789012/orders");
        assert_eq!(info.arn, "arn:hxmq:dc1:123456789012:orders");

        let fetched = registry.get("/123456789012/orders").unwrap();
        assert_eq!(fetched.arn, info.arn);
        assert!(registry.get_by_arn(&info.arn).is_some());
    }

    #[test]
    fn test_create_is_idempotent() {
        let registry = QueueRegistry::new();
        registry.create(test_queue("orders")).unwrap();
        registry.create(test_queue("orders")).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_missing_queue() {
        let registry = QueueRegistry::new();
        let err = registry.get("/123456789012/nope").unwrap_err();
        assert_eq!(err.code(), "NotFound");
    }

    #[test]
    fn test_update_attributes() {
        let registry = QueueRegistry::new();
        registry.create(test_queue("orders")).unwrap();

        let updated = registry
            .update(
                "/123456789012/orders",
                &QueueAttributeUpdate {
                    visibility_timeout_seconds: Some(120),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.visibility_timeout_seconds, 120);
        // Identity is untouched
        assert_eq!(updated.arn, "arn:hxmq:dc1:123456789012:orders");
    }

    #[test]
    fn test_remove_clears_arn_index() {
        let registry = QueueRegistry::new();
        let info = registry.create(test_queue("orders")).unwrap();
        registry.remove("/123456789012/orders").unwrap();
        assert!(registry.get_by_arn(&info.arn).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = QueueRegistry::new();
        registry.create(test_queue("zeta")).unwrap();
        registry.create(test_queue("alpha")).unwrap();
        let urls: Vec<_> = registry.list().iter().map(|q| q.url.clone()).collect();
        assert_eq!(urls, vec!["/123456789012/alpha", "/123456789012/zeta"]);
    }
}
