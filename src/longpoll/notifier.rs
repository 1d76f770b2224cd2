//! Cross-process notification transport.
//!
//! Wire contract: a single textual token (the queue ARN) terminated by
//! `;`, written on a one-shot TCP connection that is closed right after
//! the write. Delivery is best-effort: an unreachable peer is logged and
//! skipped, never surfaced to the send that triggered the notification.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::metrics::{LongPollMetrics, PEER_NOTIFY_FAILED_TOTAL, PEER_NOTIFY_SENT_TOTAL};
use crate::redis::ExponentialBackoff;

use super::{PeerSet, WaitRegistry};

/// Read deadline for one inbound notification connection.
const NOTIFY_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound fan-out of queue-ARN notifications.
#[async_trait]
pub trait QueueNotifier: Send + Sync {
    /// Tell every active peer that `arn` may have a message. Never
    /// fails; failures are logged per peer.
    async fn notify(&self, arn: &str);
}

/// TCP implementation of the notifier against the refreshed peer set.
pub struct TcpPeerNotifier {
    peers: Arc<PeerSet>,
    connect_timeout: Duration,
}

impl TcpPeerNotifier {
    pub fn new(peers: Arc<PeerSet>, connect_timeout: Duration) -> Self {
        Self {
            peers,
            connect_timeout,
        }
    }

    async fn notify_peer(&self, addr: &str, arn: &str) -> std::io::Result<()> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.write_all(format!("{};", arn).as_bytes()).await?;
        // One-shot connection: close immediately, no response is read
        stream.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl QueueNotifier for TcpPeerNotifier {
    async fn notify(&self, arn: &str) {
        let peers = self.peers.active().await;
        if peers.is_empty() {
            return;
        }

        let sends = peers.iter().map(|peer| {
            let addr = peer.addr();
            async move {
                match self.notify_peer(&addr, arn).await {
                    Ok(()) => {
                        PEER_NOTIFY_SENT_TOTAL.inc();
                        tracing::debug!(peer = %addr, arn = %arn, "Peer notified");
                    }
                    Err(e) => {
                        PEER_NOTIFY_FAILED_TOTAL.inc();
                        tracing::warn!(
                            peer = %addr,
                            arn = %arn,
                            error = %e,
                            "Peer notification failed, skipping"
                        );
                    }
                }
            }
        });
        join_all(sends).await;
    }
}

/// Accept loop for notifications from other servers. Each accepted
/// connection carries delimited ARN tokens that are fed straight into
/// the local wait registry.
pub struct NotificationListener {
    listener: TcpListener,
    registry: Arc<WaitRegistry>,
    shutdown: broadcast::Receiver<()>,
}

impl NotificationListener {
    pub async fn bind(
        addr: &str,
        registry: Arc<WaitRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry,
            shutdown,
        })
    }

    /// Bound address; with port 0 this is where peers must be pointed.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self) {
        let addr = self.listener.local_addr().ok();
        tracing::info!(addr = ?addr, "Notification listener started");

        let mut backoff = ExponentialBackoff::new();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::info!("Notification listener received shutdown signal");
                    break;
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            backoff.reset();
                            let registry = self.registry.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, peer, registry).await;
                            });
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            tracing::warn!(
                                error = %e,
                                retry_delay_ms = delay.as_millis(),
                                "Accept failed, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        tracing::info!("Notification listener stopped");
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, registry: Arc<WaitRegistry>) {
    let mut buf = Vec::with_capacity(256);
    // The sender closes right after writing, so read-to-end terminates
    // with the full frame
    match timeout(NOTIFY_READ_TIMEOUT, stream.read_to_end(&mut buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, error = %e, "Failed to read notification");
            return;
        }
        Err(_) => {
            tracing::warn!(peer = %peer, "Notification read timed out");
            return;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    for token in text.split(';') {
        let arn = token.trim();
        if arn.is_empty() {
            continue;
        }
        if registry.notify_one(arn) {
            LongPollMetrics::record_remote_wake();
            tracing::debug!(peer = %peer, arn = %arn, "Remote notification woke a waiter");
        } else {
            tracing::debug!(peer = %peer, arn = %arn, "Remote notification had no waiters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::longpoll::PeerRecord;

    #[tokio::test]
    async fn test_listener_feeds_registry() {
        let registry = Arc::new(WaitRegistry::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let listener = NotificationListener::bind("127.0.0.1:0", registry.clone(), shutdown_rx)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(listener.run());

        let mut ticket = registry.register("arn:hxmq:dc1:123:orders");

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"arn:hxmq:dc1:123:orders;")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();

        timeout(Duration::from_secs(2), &mut ticket.permit)
            .await
            .expect("waiter should be woken")
            .expect("permit should be delivered");

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_notifier_delivers_to_listener() {
        let registry = Arc::new(WaitRegistry::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let listener = NotificationListener::bind("127.0.0.1:0", registry.clone(), shutdown_rx)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(listener.run());

        let mut ticket = registry.register("arn:hxmq:dc1:123:orders");

        let peers = Arc::new(PeerSet::new());
        peers
            .replace(vec![PeerRecord {
                host: addr.ip().to_string(),
                port: addr.port(),
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                datacenter: "dc1".to_string(),
            }])
            .await;

        let notifier = TcpPeerNotifier::new(peers, Duration::from_secs(1));
        notifier.notify("arn:hxmq:dc1:123:orders").await;

        timeout(Duration::from_secs(2), &mut ticket.permit)
            .await
            .expect("waiter should be woken")
            .expect("permit should be delivered");

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_notify_unreachable_peer_is_swallowed() {
        let peers = Arc::new(PeerSet::new());
        peers
            .replace(vec![PeerRecord {
                host: "127.0.0.1".to_string(),
                // Reserved port with nothing listening
                port: 1,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                datacenter: "dc1".to_string(),
            }])
            .await;

        let notifier = TcpPeerNotifier::new(peers, Duration::from_millis(200));
        // Must not panic or error
        notifier.notify("arn:hxmq:dc1:123:orders").await;
    }
}
