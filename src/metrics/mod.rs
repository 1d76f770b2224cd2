//! Prometheus metrics for the queue service.
//!
//! Covers the hot paths the operators actually watch: message throughput,
//! visibility promotions, cache fill activity, and long-poll coordination.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "hxmq";

lazy_static! {
    // ============================================================================
    // Message Metrics
    // ============================================================================

    /// Total messages accepted (durable write succeeded)
    pub static ref MESSAGES_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_sent_total", METRIC_PREFIX),
        "Total messages accepted for delivery"
    ).unwrap();

    /// Total messages handed to receivers
    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_received_total", METRIC_PREFIX),
        "Total messages returned by receive calls"
    ).unwrap();

    /// Total messages deleted
    pub static ref MESSAGES_DELETED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_deleted_total", METRIC_PREFIX),
        "Total messages deleted"
    ).unwrap();

    /// Hidden messages promoted back to visible by the sweeper
    pub static ref MESSAGES_PROMOTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_promoted_total", METRIC_PREFIX),
        "Total hidden messages returned to the visible set"
    ).unwrap();

    // ============================================================================
    // Cache Metrics
    // ============================================================================

    /// Cache fills started, by trigger
    pub static ref CACHE_FILLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_cache_fills_total", METRIC_PREFIX),
        "Cache fill tasks started",
        &["trigger"]
    ).unwrap();

    /// Reads served from the durable store instead of the cache
    pub static ref CACHE_BYPASS_READS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_cache_bypass_reads_total", METRIC_PREFIX),
        "Receive calls served directly from the durable store"
    ).unwrap();

    /// Cache write failures absorbed by the degrade path
    pub static ref CACHE_WRITE_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_cache_write_failures_total", METRIC_PREFIX),
        "Cache writes that failed and were left to the consistency check"
    ).unwrap();

    // ============================================================================
    // Long-Poll Metrics
    // ============================================================================

    /// Pending long-poll waiters across all queues
    pub static ref LONGPOLL_WAITERS: IntGauge = register_int_gauge!(
        format!("{}_longpoll_waiters", METRIC_PREFIX),
        "Currently suspended receive calls"
    ).unwrap();

    /// Waiter wakeups, by source
    pub static ref LONGPOLL_WAKES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_longpoll_wakes_total", METRIC_PREFIX),
        "Long-poll waiters woken",
        &["source"]
    ).unwrap();

    /// Cross-process notifications sent to peers
    pub static ref PEER_NOTIFY_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_peer_notify_sent_total", METRIC_PREFIX),
        "Queue-ARN notifications written to peer servers"
    ).unwrap();

    /// Cross-process notifications that could not be delivered
    pub static ref PEER_NOTIFY_FAILED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_peer_notify_failed_total", METRIC_PREFIX),
        "Queue-ARN notifications dropped after a connect/write failure"
    ).unwrap();

    /// Active peers known from the heartbeat directory
    pub static ref PEERS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_peers_active", METRIC_PREFIX),
        "Peer servers considered active long-poll listeners"
    ).unwrap();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording long-poll metrics
pub struct LongPollMetrics;

impl LongPollMetrics {
    pub fn record_registered() {
        LONGPOLL_WAITERS.inc();
    }

    pub fn record_completed() {
        LONGPOLL_WAITERS.dec();
    }

    pub fn record_local_wake() {
        LONGPOLL_WAKES_TOTAL.with_label_values(&["local"]).inc();
    }

    pub fn record_remote_wake() {
        LONGPOLL_WAKES_TOTAL.with_label_values(&["remote"]).inc();
    }
}

/// Helper struct for recording cache-fill metrics
pub struct CacheMetrics;

impl CacheMetrics {
    pub fn record_fill_cold_start() {
        CACHE_FILLS_TOTAL.with_label_values(&["cold_start"]).inc();
    }

    pub fn record_fill_consistency() {
        CACHE_FILLS_TOTAL.with_label_values(&["consistency"]).inc();
    }

    pub fn record_bypass_read() {
        CACHE_BYPASS_READS_TOTAL.inc();
    }

    pub fn record_write_failure() {
        CACHE_WRITE_FAILURES_TOTAL.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        MESSAGES_SENT_TOTAL.inc();
        let encoded = encode_metrics().expect("metrics should encode");
        assert!(encoded.contains("hxmq_messages_sent_total"));
    }
}
