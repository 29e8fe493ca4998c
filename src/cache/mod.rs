//! Distributed cache adapters.
//!
//! The session manager only talks to the `DistributedCache` trait; this module
//! provides an in-process cluster for standalone use and tests, and a Redis
//! implementation for multi-node deployments.

mod backoff;
mod factory;
mod memory;
mod redis_events;
mod redis_store;
mod traits;
mod types;

pub use backoff::ReconnectBackoff;
pub use factory::{create_distributed_cache, CacheHandle};
pub use memory::{MemoryCacheStats, MemoryCluster, MemoryDistributedCache, MemoryOwnership};
pub use redis_events::RedisEventRelay;
pub use redis_store::{RedisDistributedCache, RedisOwnership};
pub use traits::{DistributedCache, SessionOwnership};
pub use types::{CacheBackend, CacheError, ClusterConfig, ClusterEvent, LockResult};
