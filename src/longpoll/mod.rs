//! Long-poll coordination.
//!
//! A receive call that finds nothing registers a waiter under the queue
//! ARN and suspends (async, no worker thread held) until a local or
//! cross-process notification arrives or its deadline passes. Sends wake
//! at most one local waiter and broadcast the ARN to every active peer
//! server over a one-shot TCP connection.

mod notifier;
mod peers;
mod registry;

pub use notifier::{NotificationListener, QueueNotifier, TcpPeerNotifier};
pub use peers::{
    create_peer_directory, filter_active_peers, DirectoryError, MemoryPeerDirectory,
    PeerDirectory, PeerRecord, PeerSet, RedisPeerDirectory,
};
pub use registry::{WaitRegistry, WaitTicket};
