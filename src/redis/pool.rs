//! Redis connection pool for the cache backend and peer directory.
//!
//! Provides a managed multiplexed connection with circuit breaker
//! integration so cache traffic degrades instead of cascading failures.

use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;

use super::{CircuitBreaker, CircuitState, RedisHealth};

/// Error type for Redis pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Circuit breaker is open
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// Connection not available
    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

/// Redis connection pool for cache and directory operations.
///
/// Uses a multiplexed connection shared across tasks; the pub/sub-free
/// command traffic of this service needs no dedicated connections.
pub struct RedisPool {
    /// Redis client for creating connections
    client: Client,

    /// Multiplexed connection (shared across tasks)
    connection: RwLock<Option<MultiplexedConnection>>,

    /// Circuit breaker for fault tolerance
    circuit_breaker: Arc<CircuitBreaker>,

    /// Health tracker
    health: Arc<RedisHealth>,

    /// Configuration
    config: RedisConfig,
}

impl RedisPool {
    pub fn new(
        config: RedisConfig,
        circuit_breaker: Arc<CircuitBreaker>,
        health: Arc<RedisHealth>,
    ) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            circuit_breaker,
            health,
            config,
        })
    }

    /// Get a connection from the pool.
    ///
    /// Establishes a new connection if none exists. Returns an error if
    /// the circuit breaker is open.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if !self.circuit_breaker.allow_request() {
            self.health.set_circuit_open();
            return Err(PoolError::CircuitOpen);
        }

        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, PoolError> {
        let mut conn_guard = self.connection.write().await;

        // Double-check in case another task connected while we waited
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        self.health.set_reconnecting();

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                self.circuit_breaker.record_success();
                self.health.set_connected();
                tracing::info!("Redis pool connection established");
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Execute a Redis command with circuit breaker protection.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                // Connection errors invalidate the cached connection so the
                // next call reconnects
                if e.is_connection_dropped() || e.is_io_error() {
                    let mut conn_guard = self.connection.write().await;
                    *conn_guard = None;
                }
                self.circuit_breaker.record_failure();
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Check if the pool is healthy (circuit breaker closed and connected).
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy() && self.circuit_breaker.state() == CircuitState::Closed
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Ping Redis to check connectivity.
    pub async fn ping(&self) -> Result<(), PoolError> {
        let mut conn = self.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Extension trait for the Redis commands the cache backend and peer
/// directory use.
#[async_trait::async_trait]
pub trait RedisPoolExt {
    // Sorted set operations (visible-message index)

    /// Add members with scores to a sorted set.
    async fn zadd_multiple(&self, key: &str, items: &[(f64, &str)]) -> Result<(), PoolError>;

    /// Pop up to `count` lowest-scored members.
    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<String>, PoolError>;

    /// Remove a member from a sorted set.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, PoolError>;

    /// Sorted set cardinality.
    async fn zcard(&self, key: &str) -> Result<usize, PoolError>;

    /// First `limit` members in score order.
    async fn zrange_head(&self, key: &str, limit: usize) -> Result<Vec<String>, PoolError>;

    // Hash operations (message bodies, peer records)

    /// Set a hash field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), PoolError>;

    /// Set multiple hash fields.
    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), PoolError>;

    /// Get a hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError>;

    /// Get all hash fields and values.
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, PoolError>;

    /// Delete hash fields.
    async fn hdel_fields(&self, key: &str, fields: &[&str]) -> Result<(), PoolError>;

    // Key operations

    /// Delete keys.
    async fn del_keys(&self, keys: &[&str]) -> Result<(), PoolError>;
}

#[async_trait::async_trait]
impl RedisPoolExt for RedisPool {
    async fn zadd_multiple(&self, key: &str, items: &[(f64, &str)]) -> Result<(), PoolError> {
        let key = key.to_string();
        let items: Vec<(f64, String)> = items
            .iter()
            .map(|(score, member)| (*score, member.to_string()))
            .collect();
        self.execute(|mut conn| async move {
            conn.zadd_multiple::<_, _, _, ()>(key, &items).await
        })
        .await
    }

    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<String>, PoolError> {
        let key = key.to_string();
        // ZPOPMIN returns alternating member/score pairs
        let flat: Vec<String> = self
            .execute(|mut conn| async move { conn.zpopmin(key, count as isize).await })
            .await?;
        Ok(flat
            .into_iter()
            .enumerate()
            .filter_map(|(i, v)| if i % 2 == 0 { Some(v) } else { None })
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, PoolError> {
        let key = key.to_string();
        let member = member.to_string();
        let removed: u32 = self
            .execute(|mut conn| async move { conn.zrem(key, member).await })
            .await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<usize, PoolError> {
        let key = key.to_string();
        self.execute(|mut conn| async move { conn.zcard(key).await })
            .await
    }

    async fn zrange_head(&self, key: &str, limit: usize) -> Result<Vec<String>, PoolError> {
        let key = key.to_string();
        self.execute(|mut conn| async move {
            conn.zrange(key, 0, limit as isize - 1).await
        })
        .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), PoolError> {
        let key = key.to_string();
        let field = field.to_string();
        let value = value.to_string();
        self.execute(|mut conn| async move { conn.hset::<_, _, _, ()>(key, field, value).await })
            .await
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), PoolError> {
        let key = key.to_string();
        let fields: Vec<(String, String)> = fields
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect();
        self.execute(|mut conn| async move {
            conn.hset_multiple::<_, _, _, ()>(key, &fields).await
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError> {
        let key = key.to_string();
        let field = field.to_string();
        self.execute(|mut conn| async move { conn.hget(key, field).await })
            .await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, PoolError> {
        let key = key.to_string();
        self.execute(|mut conn| async move { conn.hgetall(key).await })
            .await
    }

    async fn hdel_fields(&self, key: &str, fields: &[&str]) -> Result<(), PoolError> {
        let key = key.to_string();
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        self.execute(|mut conn| async move { conn.hdel::<_, _, ()>(key, fields).await })
            .await
    }

    async fn del_keys(&self, keys: &[&str]) -> Result<(), PoolError> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.execute(|mut conn| async move { conn.del::<_, ()>(keys).await })
            .await
    }
}
