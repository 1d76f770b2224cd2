use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub queue_defaults: QueueDefaults,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub longpoll: LongPollConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Identity of this API-server process within the fleet.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier for this server instance, used as the node
    /// component of generated message ids.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Hostname other servers use to reach the notification listener.
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,
    /// Datacenter label; cross-process notifications stay within one.
    #[serde(default = "default_datacenter")]
    pub datacenter: String,
}

fn default_node_id() -> String {
    format!("hx-{}", Uuid::new_v4().simple())
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

fn default_datacenter() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout")]
    pub circuit_breaker_reset_timeout_seconds: u64,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_delay_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout() -> u64 {
    30
}

fn default_backoff_initial() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Cache backend: "memory" (default) or "redis".
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    /// Key prefix for the redis backend.
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
    /// Page size for the background cache fill scan.
    #[serde(default = "default_fill_page_size")]
    pub fill_page_size: usize,
    /// Interval for the cache/store consistency check.
    #[serde(default = "default_consistency_interval")]
    pub consistency_check_interval_seconds: u64,
}

fn default_cache_backend() -> String {
    "memory".to_string()
}

fn default_cache_prefix() -> String {
    "hxmq:cache".to_string()
}

fn default_fill_page_size() -> usize {
    500
}

fn default_consistency_interval() -> u64 {
    60
}

/// Attribute defaults applied to newly created queues.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueDefaults {
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u32,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_retention")]
    pub retention_seconds: u64,
    #[serde(default)]
    pub delay_seconds: u32,
    #[serde(default)]
    pub receive_wait_seconds: u32,
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default = "default_partitions")]
    pub partitions_per_shard: u32,
}

fn default_visibility_timeout() -> u32 {
    30
}

fn default_max_message_bytes() -> usize {
    262_144 // 256 KiB
}

fn default_retention() -> u64 {
    345_600 // 4 days
}

fn default_shards() -> u32 {
    1
}

fn default_partitions() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_batch_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_payload_bytes: usize,
}

fn default_max_batch_entries() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    /// Revisibility sweep interval. Milliseconds, so tests can run tight.
    #[serde(default = "default_sweep_interval_ms")]
    pub interval_ms: u64,
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LongPollConfig {
    /// Port the cross-process notification listener binds to. 0 picks an
    /// ephemeral port (tests).
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    /// Upper bound accepted for ReceiveMessage wait times.
    #[serde(default = "default_max_wait")]
    pub max_wait_seconds: u32,
    /// Peer directory: "memory" (single process) or "redis".
    #[serde(default = "default_directory_backend")]
    pub directory: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Heartbeats older than this are ignored when refreshing peers.
    #[serde(default = "default_peer_ttl")]
    pub peer_ttl_seconds: u64,
    #[serde(default = "default_notify_connect_timeout")]
    pub notify_connect_timeout_ms: u64,
}

fn default_listener_port() -> u16 {
    8132
}

fn default_max_wait() -> u32 {
    20
}

fn default_directory_backend() -> String {
    "memory".to_string()
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_peer_ttl() -> u64 {
    300 // 5 minutes
}

fn default_notify_connect_timeout() -> u64 {
    2_000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8130
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8130)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("cache.backend", "memory")?
            .set_default("sweeper.interval_ms", 1_000)?
            .set_default("longpoll.listener_port", 8132)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, REDIS_URL, NODE_DATACENTER, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn listener_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.longpoll.listener_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            advertise_host: default_advertise_host(),
            datacenter: default_datacenter(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout(),
            backoff_initial_delay_ms: default_backoff_initial(),
            backoff_max_delay_ms: default_backoff_max(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            prefix: default_cache_prefix(),
            fill_page_size: default_fill_page_size(),
            consistency_check_interval_seconds: default_consistency_interval(),
        }
    }
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: default_visibility_timeout(),
            max_message_bytes: default_max_message_bytes(),
            retention_seconds: default_retention(),
            delay_seconds: 0,
            receive_wait_seconds: 0,
            shards: default_shards(),
            partitions_per_shard: default_partitions(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_batch_entries(),
            max_payload_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            listener_port: default_listener_port(),
            max_wait_seconds: default_max_wait(),
            directory: default_directory_backend(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            peer_ttl_seconds: default_peer_ttl(),
            notify_connect_timeout_ms: default_notify_connect_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8130);
    }

    #[test]
    fn test_queue_defaults() {
        let defaults = QueueDefaults::default();
        assert_eq!(defaults.visibility_timeout_seconds, 30);
        assert_eq!(defaults.max_message_bytes, 262_144);
        assert_eq!(defaults.shards, 1);
        assert_eq!(defaults.partitions_per_shard, 4);
    }

    #[test]
    fn test_node_id_is_unique() {
        let a = NodeConfig::default();
        let b = NodeConfig::default();
        assert_ne!(a.node_id, b.node_id);
        assert!(a.node_id.starts_with("hx-"));
    }

    #[test]
    fn test_longpoll_defaults() {
        let lp = LongPollConfig::default();
        assert_eq!(lp.max_wait_seconds, 20);
        assert_eq!(lp.heartbeat_interval_seconds, 60);
        assert_eq!(lp.peer_ttl_seconds, 300);
    }
}
