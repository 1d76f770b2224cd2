//! Redis connection health tracking

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use super::current_time_ms;

/// Redis connection health status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedisHealthStatus {
    /// Redis is connected and healthy
    Healthy,
    /// Redis is disconnected, attempting to reconnect
    Reconnecting,
    /// Circuit breaker is open, not attempting connections
    CircuitOpen,
}

impl RedisHealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedisHealthStatus::Healthy => "healthy",
            RedisHealthStatus::Reconnecting => "reconnecting",
            RedisHealthStatus::CircuitOpen => "circuit_open",
        }
    }
}

/// Redis health tracker, surfaced on the health endpoint.
pub struct RedisHealth {
    status: AtomicU8,
    last_connected: AtomicI64,
    reconnection_attempts: AtomicU32,
}

impl RedisHealth {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(RedisHealthStatus::Reconnecting as u8),
            last_connected: AtomicI64::new(0),
            reconnection_attempts: AtomicU32::new(0),
        }
    }

    /// Mark Redis as connected
    pub fn set_connected(&self) {
        self.status
            .store(RedisHealthStatus::Healthy as u8, Ordering::Release);
        self.last_connected
            .store(current_time_ms(), Ordering::Release);
        self.reconnection_attempts.store(0, Ordering::Release);
    }

    /// Mark Redis as reconnecting
    pub fn set_reconnecting(&self) {
        self.status
            .store(RedisHealthStatus::Reconnecting as u8, Ordering::Release);
        self.reconnection_attempts.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark circuit as open
    pub fn set_circuit_open(&self) {
        self.status
            .store(RedisHealthStatus::CircuitOpen as u8, Ordering::Release);
    }

    /// Get current status
    pub fn status(&self) -> RedisHealthStatus {
        match self.status.load(Ordering::Acquire) {
            0 => RedisHealthStatus::Healthy,
            2 => RedisHealthStatus::CircuitOpen,
            _ => RedisHealthStatus::Reconnecting,
        }
    }

    /// Check if Redis is healthy
    pub fn is_healthy(&self) -> bool {
        self.status() == RedisHealthStatus::Healthy
    }

    pub fn last_connected_ms(&self) -> i64 {
        self.last_connected.load(Ordering::Acquire)
    }
}

impl Default for RedisHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_transitions() {
        let health = RedisHealth::new();
        assert_eq!(health.status(), RedisHealthStatus::Reconnecting);

        health.set_connected();
        assert!(health.is_healthy());
        assert!(health.last_connected_ms() > 0);

        health.set_circuit_open();
        assert_eq!(health.status(), RedisHealthStatus::CircuitOpen);
        assert!(!health.is_healthy());
    }
}
