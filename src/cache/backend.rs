//! Backend trait for the visible-message cache.
//!
//! The cache mirrors each queue's visible list. Backends store full
//! message values keyed by id and serve pops in id (time) order; all
//! writes are idempotent by id so the fill task and concurrent sends
//! never create duplicates.

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Message;
use crate::redis::pool::PoolError;

/// Errors from cache backends. None of them are fatal to a request: the
/// cache layer degrades to the durable store and leaves repair to the
/// consistency check.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backend operation failed
    #[error("cache backend error: {0}")]
    Backend(String),

    /// Backend is temporarily unavailable (e.g., circuit breaker open)
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<PoolError> for CacheError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Redis(e) => CacheError::Backend(e.to_string()),
            PoolError::CircuitOpen => CacheError::Unavailable("circuit breaker open".to_string()),
            PoolError::ConnectionUnavailable(msg) => CacheError::Unavailable(msg),
        }
    }
}

/// Visible-list storage for one process or a shared Redis.
#[async_trait]
pub trait MessageCache: Send + Sync {
    /// Backend type identifier for logs and stats.
    fn backend_type(&self) -> &'static str;

    /// Insert a message into the visible set. Idempotent by id.
    async fn put_visible(&self, queue_url: &str, message: &Message) -> Result<(), CacheError>;

    /// Insert a batch of messages into the visible set.
    async fn put_visible_many(
        &self,
        queue_url: &str,
        messages: &[Message],
    ) -> Result<(), CacheError>;

    /// Pop up to `max` messages from the front (lowest ids) of the
    /// visible set.
    async fn pop_visible(&self, queue_url: &str, max: usize) -> Result<Vec<Message>, CacheError>;

    /// Remove one message by id. Returns whether it was present.
    async fn remove(&self, queue_url: &str, id: &str) -> Result<bool, CacheError>;

    /// Number of visible messages.
    async fn visible_count(&self, queue_url: &str) -> Result<usize, CacheError>;

    /// Ids of the first `limit` visible messages, in order.
    async fn ids_from_head(&self, queue_url: &str, limit: usize)
        -> Result<Vec<String>, CacheError>;

    /// Drop every visible message for a queue. Returns how many.
    async fn clear(&self, queue_url: &str) -> Result<usize, CacheError>;
}
