//! Peer-server discovery via heartbeat records.
//!
//! Each server publishes (host, port, timestamp, datacenter) to a shared
//! durable table roughly once a minute and reads the table back to learn
//! which peers are actively listening for long-poll notifications. A row
//! counts as active only while its heartbeat is younger than the TTL and
//! its datacenter matches the reader's; membership is deliberately
//! approximate with bounded staleness.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::LongPollConfig;
use crate::metrics::PEERS_ACTIVE;
use crate::redis::pool::{PoolError, RedisPool, RedisPoolExt};

/// One row of the heartbeat table, keyed by host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerRecord {
    pub host: String,
    /// Notification listener port.
    pub port: u16,
    /// Last publish time, ms since epoch.
    pub timestamp_ms: i64,
    pub datacenter: String,
}

impl PeerRecord {
    pub fn is_fresh(&self, now_ms: i64, ttl_ms: i64) -> bool {
        now_ms - self.timestamp_ms < ttl_ms
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory backend error: {0}")]
    Backend(String),

    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<PoolError> for DirectoryError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Redis(e) => DirectoryError::Backend(e.to_string()),
            PoolError::CircuitOpen => {
                DirectoryError::Unavailable("circuit breaker open".to_string())
            }
            PoolError::ConnectionUnavailable(msg) => DirectoryError::Unavailable(msg),
        }
    }
}

/// Shared heartbeat table.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Upsert this server's heartbeat row.
    async fn publish(&self, record: &PeerRecord) -> Result<(), DirectoryError>;

    /// Read every heartbeat row, fresh or not; callers filter.
    async fn list(&self) -> Result<Vec<PeerRecord>, DirectoryError>;
}

/// Single-process directory used in tests and standalone mode.
pub struct MemoryPeerDirectory {
    records: DashMap<String, PeerRecord>,
}

impl MemoryPeerDirectory {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl Default for MemoryPeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerDirectory for MemoryPeerDirectory {
    async fn publish(&self, record: &PeerRecord) -> Result<(), DirectoryError> {
        self.records.insert(record.host.clone(), record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PeerRecord>, DirectoryError> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}

/// Redis-backed directory: one hash, host field, JSON row value.
pub struct RedisPeerDirectory {
    pool: Arc<RedisPool>,
    key: String,
}

impl RedisPeerDirectory {
    pub fn new(pool: Arc<RedisPool>, key: String) -> Self {
        Self { pool, key }
    }
}

#[async_trait]
impl PeerDirectory for RedisPeerDirectory {
    async fn publish(&self, record: &PeerRecord) -> Result<(), DirectoryError> {
        let json = serde_json::to_string(record)?;
        self.pool.hset(&self.key, &record.host, &json).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PeerRecord>, DirectoryError> {
        let rows = self.pool.hgetall(&self.key).await?;
        let mut records = Vec::with_capacity(rows.len());
        for (host, json) in rows {
            match serde_json::from_str::<PeerRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "Skipping undecodable heartbeat row");
                }
            }
        }
        Ok(records)
    }
}

/// Create a peer directory based on configuration.
pub fn create_peer_directory(
    settings: &LongPollConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn PeerDirectory> {
    match settings.directory.as_str() {
        "redis" => {
            if let Some(pool) = redis_pool {
                tracing::info!(directory = "redis", "Creating Redis peer directory");
                Arc::new(RedisPeerDirectory::new(pool, "hxmq:peers".to_string()))
            } else {
                tracing::warn!(
                    "Redis peer directory requested but no pool provided, falling back to memory"
                );
                Arc::new(MemoryPeerDirectory::new())
            }
        }
        _ => {
            tracing::info!(directory = "memory", "Creating memory peer directory");
            Arc::new(MemoryPeerDirectory::new())
        }
    }
}

/// The refreshed view of active peers, shared between the heartbeat task
/// (writer) and the notifier (reader).
pub struct PeerSet {
    peers: RwLock<Vec<PeerRecord>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
        }
    }

    pub async fn active(&self) -> Vec<PeerRecord> {
        self.peers.read().await.clone()
    }

    pub async fn replace(&self, peers: Vec<PeerRecord>) {
        PEERS_ACTIVE.set(peers.len() as i64);
        *self.peers.write().await = peers;
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter directory rows down to the peers worth notifying: fresh, same
/// datacenter, and not this server.
pub fn filter_active_peers(
    records: Vec<PeerRecord>,
    own_host: &str,
    datacenter: &str,
    ttl_ms: i64,
) -> Vec<PeerRecord> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .into_iter()
        .filter(|r| r.host != own_host)
        .filter(|r| r.datacenter == datacenter)
        .filter(|r| r.is_fresh(now_ms, ttl_ms))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(host: &str, datacenter: &str, age_ms: i64) -> PeerRecord {
        PeerRecord {
            host: host.to_string(),
            port: 8132,
            timestamp_ms: Utc::now().timestamp_millis() - age_ms,
            datacenter: datacenter.to_string(),
        }
    }

    #[tokio::test]
    async fn test_memory_directory_upserts_by_host() {
        let directory = MemoryPeerDirectory::new();
        directory.publish(&record("a", "dc1", 0)).await.unwrap();
        directory.publish(&record("a", "dc1", 0)).await.unwrap();
        directory.publish(&record("b", "dc1", 0)).await.unwrap();

        assert_eq!(directory.list().await.unwrap().len(), 2);
    }

    #[test]
    fn test_filter_excludes_self_stale_and_foreign() {
        let records = vec![
            record("self", "dc1", 0),
            record("fresh-peer", "dc1", 1_000),
            record("stale-peer", "dc1", 400_000),
            record("other-dc", "dc2", 0),
        ];

        let active = filter_active_peers(records, "self", "dc1", 300_000);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].host, "fresh-peer");
    }

    #[tokio::test]
    async fn test_peer_set_replace() {
        let set = PeerSet::new();
        assert!(set.active().await.is_empty());

        set.replace(vec![record("a", "dc1", 0)]).await;
        assert_eq!(set.active().await.len(), 1);
    }

    #[test]
    fn test_record_freshness() {
        let fresh = record("a", "dc1", 1_000);
        let now = Utc::now().timestamp_millis();
        assert!(fresh.is_fresh(now, 300_000));
        assert!(!fresh.is_fresh(now + 400_000, 300_000));
    }
}
