//! Redis high availability module
//!
//! Provides circuit breaker pattern and exponential backoff for Redis
//! connections used by the cache backend and the peer directory.

mod backoff;
mod circuit_breaker;
mod health;
pub mod pool;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use health::{RedisHealth, RedisHealthStatus};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
