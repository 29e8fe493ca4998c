//! Factory for creating the distributed cache

use std::sync::Arc;

use crate::config::RedisConfig;

use super::memory::MemoryDistributedCache;
use super::redis_store::RedisDistributedCache;
use super::traits::DistributedCache;
use super::types::ClusterConfig;

/// The cache a node runs with, plus what the binary needs to wire it up
pub struct CacheHandle {
    pub cache: Arc<dyn DistributedCache>,
    /// Present when Redis pub/sub events must be relayed into the cache's event channel
    pub redis: Option<Arc<RedisDistributedCache>>,
}

/// Create a distributed cache based on configuration.
///
/// Falls back to a standalone in-memory cache when cluster mode is disabled
/// or Redis cannot be reached.
pub async fn create_distributed_cache(cluster: &ClusterConfig, redis: &RedisConfig) -> CacheHandle {
    if cluster.enabled {
        match RedisDistributedCache::connect(redis, cluster.clone()).await {
            Ok(cache) => {
                tracing::info!(
                    node_id = %cluster.node_id,
                    "Creating Redis distributed cache for cluster mode"
                );
                let cache = Arc::new(cache);
                return CacheHandle {
                    cache: cache.clone(),
                    redis: Some(cache),
                };
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Cluster mode enabled but Redis not available, falling back to standalone mode"
                );
            }
        }
    } else {
        tracing::info!("Cluster mode disabled, using standalone in-memory cache");
    }

    CacheHandle {
        cache: Arc::new(MemoryDistributedCache::standalone(cluster.node_id.clone())),
        redis: None,
    }
}
