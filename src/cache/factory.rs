//! Cache backend factory

use std::sync::Arc;

use crate::config::CacheSettings;
use crate::redis::pool::RedisPool;

use super::memory_backend::MemoryMessageCache;
use super::redis_backend::RedisMessageCache;
use super::MessageCache;

/// Create a cache backend based on configuration.
///
/// - `"redis"`: shared Redis cache, if a pool is provided
/// - `"memory"` (default): per-process in-memory cache
pub fn create_message_cache(
    settings: &CacheSettings,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn MessageCache> {
    match settings.backend.as_str() {
        "redis" => {
            if let Some(pool) = redis_pool {
                tracing::info!(
                    backend = "redis",
                    prefix = %settings.prefix,
                    "Creating Redis message cache"
                );
                Arc::new(RedisMessageCache::new(pool, settings.prefix.clone()))
            } else {
                tracing::warn!(
                    "Redis cache backend requested but no pool provided, falling back to memory"
                );
                Arc::new(MemoryMessageCache::new())
            }
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory message cache");
            Arc::new(MemoryMessageCache::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_memory() {
        let settings = CacheSettings::default();
        let cache = create_message_cache(&settings, None);
        assert_eq!(cache.backend_type(), "memory");
    }

    #[test]
    fn test_redis_without_pool_falls_back() {
        let settings = CacheSettings {
            backend: "redis".to_string(),
            ..Default::default()
        };
        let cache = create_message_cache(&settings, None);
        assert_eq!(cache.backend_type(), "memory");
    }
}
