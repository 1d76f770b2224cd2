mod settings;

pub use settings::{
    BatchConfig, CacheSettings, LongPollConfig, NodeConfig, QueueDefaults, RedisConfig,
    ServerConfig, Settings, SweeperConfig,
};
