//! Distributed cache abstraction consumed by the session manager

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::session::{IncomingSessionData, OutgoingSessionData};

use super::types::{CacheBackend, CacheError, ClusterEvent, LockResult};

/// Replicated store holding the authoritative copy of every session.
///
/// Implementations:
/// - `MemoryDistributedCache`: in-process cluster, used standalone and in tests
/// - `RedisDistributedCache`: Redis-backed store shared by every node
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Identifier of the node this handle belongs to
    fn node_id(&self) -> &str;

    fn backend_type(&self) -> CacheBackend;

    /// Read a session; `include_attributes = false` returns metadata only
    async fn get_session_data(
        &self,
        real_id: &str,
        include_attributes: bool,
    ) -> Result<Option<IncomingSessionData>, CacheError>;

    /// Apply an outgoing delta and announce the change to the cluster
    async fn store_session_data(&self, data: &OutgoingSessionData) -> Result<(), CacheError>;

    /// Remove a session cluster-wide
    async fn remove_session(&self, real_id: &str) -> Result<(), CacheError>;

    /// Remove this node's copy without notifying other nodes
    async fn remove_session_local(&self, real_id: &str) -> Result<(), CacheError>;

    /// Drop any node-local memory held for the session, keeping the replicated copy
    async fn evict_session(&self, real_id: &str) -> Result<(), CacheError>;

    /// All known session ids mapped to their last owner
    async fn session_ids(&self) -> Result<HashMap<String, String>, CacheError>;

    /// Whether this node holds data for the session
    async fn is_local(&self, real_id: &str) -> bool;

    /// Best guess at the node that owns the session
    async fn locate(&self, real_id: &str) -> Option<String>;

    /// Ownership capability, if the backend supports it
    fn ownership(&self) -> Option<Arc<dyn SessionOwnership>>;

    /// Subscribe to change notifications from other nodes
    fn subscribe(&self) -> Option<broadcast::Receiver<ClusterEvent>>;
}

/// Cluster-wide exclusive ownership of individual sessions
#[async_trait]
pub trait SessionOwnership: Send + Sync {
    /// Wait until this node owns the session
    async fn acquire_session_ownership(
        &self,
        real_id: &str,
        new_lock: bool,
    ) -> Result<LockResult, CacheError>;

    async fn relinquish_session_ownership(&self, real_id: &str, remove: bool) -> Result<(), CacheError>;
}
