//! Durable message store abstraction.
//!
//! The production column store is driven through this trait; the core
//! only needs keyed insert, ordered scan from a cursor, delete, and
//! count. `MemoryDurableStore` backs tests and standalone deployments.

mod memory;

pub use memory::MemoryDurableStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Message;

/// Errors from the durable store. All of them surface to callers as
/// `InternalError`; the store's own atomicity bounds partial effects.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Black-box durable store with ordered scan.
///
/// Implementations must be thread-safe; every operation may be called
/// concurrently from request workers, the fill task, and the sweeper.
#[async_trait]
pub trait DurableMessageStore: Send + Sync {
    /// Persist a message. Send calls do not report success until this
    /// returns Ok.
    async fn insert(&self, queue_url: &str, message: &Message) -> Result<(), StoreError>;

    /// Persist a batch of messages.
    async fn insert_batch(&self, queue_url: &str, messages: &[Message]) -> Result<(), StoreError>;

    /// Fetch one message by id.
    async fn get(&self, queue_url: &str, id: &str) -> Result<Option<Message>, StoreError>;

    /// Scan messages ordered by id, resuming after `after` when given.
    async fn scan(
        &self,
        queue_url: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Delete one message. Returns whether it existed.
    async fn delete(&self, queue_url: &str, id: &str) -> Result<bool, StoreError>;

    /// Number of stored (visible + hidden) messages for a queue.
    async fn count(&self, queue_url: &str) -> Result<usize, StoreError>;

    /// Remove every message for a queue. Returns how many were removed.
    async fn purge(&self, queue_url: &str) -> Result<usize, StoreError>;
}
