//! Heartbeat publish / peer refresh task.
//!
//! Publishes this server's (host, port, timestamp, datacenter) row to
//! the shared directory roughly once a minute and refreshes the local
//! view of active long-poll listeners from the same table. Peers are
//! filtered to the same datacenter and a bounded heartbeat age, trading
//! perfect membership for locality and cheap reads.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::{LongPollConfig, NodeConfig};
use crate::longpoll::{filter_active_peers, PeerDirectory, PeerRecord, PeerSet};

pub struct HeartbeatTask {
    config: LongPollConfig,
    node: NodeConfig,
    /// Actual bound notification port (config may have said 0).
    listener_port: u16,
    directory: Arc<dyn PeerDirectory>,
    peers: Arc<PeerSet>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: LongPollConfig,
        node: NodeConfig,
        listener_port: u16,
        directory: Arc<dyn PeerDirectory>,
        peers: Arc<PeerSet>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            node,
            listener_port,
            directory,
            peers,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let interval = Duration::from_secs(self.config.heartbeat_interval_seconds.max(1));
        let mut timer = tokio::time::interval(interval);

        tracing::info!(
            host = %self.node.advertise_host,
            port = self.listener_port,
            datacenter = %self.node.datacenter,
            interval_secs = self.config.heartbeat_interval_seconds,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    // First tick fires immediately, so peers are known
                    // shortly after startup
                    self.publish().await;
                    self.refresh().await;
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    async fn publish(&self) {
        let record = PeerRecord {
            host: self.node.advertise_host.clone(),
            port: self.listener_port,
            timestamp_ms: Utc::now().timestamp_millis(),
            datacenter: self.node.datacenter.clone(),
        };
        if let Err(e) = self.directory.publish(&record).await {
            tracing::warn!(error = %e, "Failed to publish heartbeat");
        }
    }

    async fn refresh(&self) {
        let records = match self.directory.list().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read heartbeat table, keeping stale peer list");
                return;
            }
        };

        let total = records.len();
        let active = filter_active_peers(
            records,
            &self.node.advertise_host,
            &self.node.datacenter,
            (self.config.peer_ttl_seconds * 1_000) as i64,
        );
        tracing::debug!(
            total = total,
            active = active.len(),
            "Refreshed peer list"
        );
        self.peers.replace(active).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::longpoll::MemoryPeerDirectory;

    #[tokio::test]
    async fn test_heartbeat_publishes_and_refreshes() {
        let directory = Arc::new(MemoryPeerDirectory::new());
        // Pre-seed a fresh peer in the same datacenter
        directory
            .publish(&PeerRecord {
                host: "peer-1".to_string(),
                port: 8132,
                timestamp_ms: Utc::now().timestamp_millis(),
                datacenter: "dc1".to_string(),
            })
            .await
            .unwrap();

        let peers = Arc::new(PeerSet::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let node = NodeConfig {
            node_id: "self".to_string(),
            advertise_host: "self-host".to_string(),
            datacenter: "dc1".to_string(),
        };
        let task = HeartbeatTask::new(
            LongPollConfig {
                heartbeat_interval_seconds: 1,
                ..Default::default()
            },
            node,
            8132,
            directory.clone(),
            peers.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(task.run());

        // First tick is immediate; wait for the refresh to land
        for _ in 0..50 {
            if !peers.active().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let active = peers.active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].host, "peer-1");

        // Our own row landed in the directory
        let rows = directory.list().await.unwrap();
        assert!(rows.iter().any(|r| r.host == "self-host"));

        shutdown_tx.send(()).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
