//! In-process distributed cache.
//!
//! A `MemoryCluster` is the shared replicated store; every node gets its own
//! `MemoryDistributedCache` handle onto it. Without a real network the cluster
//! behaves as a single last-write-wins map with an ownership table and an
//! event bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};

use crate::session::{AttributeMap, IncomingSessionData, OutgoingSessionData, SessionMetadata};

use super::traits::{DistributedCache, SessionOwnership};
use super::types::{CacheBackend, CacheError, ClusterEvent, LockResult};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredSession {
    version: u64,
    timestamp: i64,
    metadata: SessionMetadata,
    attributes: AttributeMap,
    owner: String,
}

#[derive(Debug, Default)]
struct LockEntry {
    holder: Option<String>,
    last_holder: Option<String>,
}

/// State shared by all nodes of an in-process cluster
pub struct MemoryCluster {
    store: DashMap<String, StoredSession>,
    locks: DashMap<String, LockEntry>,
    lock_released: Notify,
    events: broadcast::Sender<ClusterEvent>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            store: DashMap::new(),
            locks: DashMap::new(),
            lock_released: Notify::new(),
            events,
        })
    }

    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    pub fn contains(&self, real_id: &str) -> bool {
        self.store.contains_key(real_id)
    }

    /// Version currently stored for a session
    pub fn version_of(&self, real_id: &str) -> Option<u64> {
        self.store.get(real_id).map(|s| s.version)
    }

    /// Node currently holding ownership of a session
    pub fn lock_holder(&self, real_id: &str) -> Option<String> {
        self.locks.get(real_id).and_then(|entry| entry.holder.clone())
    }

    fn publish(&self, event: ClusterEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn try_lock(&self, real_id: &str, node_id: &str, new_lock: bool) -> Option<LockResult> {
        let mut guard = self.locks.entry(real_id.to_string()).or_default();
        let entry = &mut *guard;
        if let Some(holder) = entry.holder.as_deref() {
            return (holder == node_id).then_some(LockResult::AlreadyHeld);
        }

        let from_cluster = !new_lock
            && matches!(entry.last_holder.as_deref(), Some(last) if last != node_id);
        entry.holder = Some(node_id.to_string());
        entry.last_holder = Some(node_id.to_string());
        Some(if from_cluster {
            LockResult::AcquiredFromCluster
        } else {
            LockResult::NewLock
        })
    }

    fn unlock(&self, real_id: &str, node_id: &str, remove: bool) {
        let mut released = false;
        if let Some(mut entry) = self.locks.get_mut(real_id) {
            if entry.holder.as_deref() == Some(node_id) {
                entry.holder = None;
                released = true;
            }
        }
        if remove {
            self.locks.remove_if(real_id, |_, entry| entry.holder.is_none());
        }
        if released {
            self.lock_released.notify_waiters();
        }
    }
}

/// Operation counters of one node's cache handle
#[derive(Debug, Default)]
struct CacheCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    removals: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryCacheStats {
    pub reads: u64,
    pub writes: u64,
    pub removals: u64,
    pub evictions: u64,
}

/// One node's view of a `MemoryCluster`
pub struct MemoryDistributedCache {
    node_id: String,
    cluster: Arc<MemoryCluster>,
    ownership: Option<Arc<MemoryOwnership>>,
    counters: CacheCounters,
}

impl MemoryDistributedCache {
    pub fn new(cluster: Arc<MemoryCluster>, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let ownership = Arc::new(MemoryOwnership {
            node_id: node_id.clone(),
            cluster: cluster.clone(),
        });
        Self {
            node_id,
            cluster,
            ownership: Some(ownership),
            counters: CacheCounters::default(),
        }
    }

    /// Standalone cache for a single node
    pub fn standalone(node_id: impl Into<String>) -> Self {
        Self::new(MemoryCluster::new(), node_id)
    }

    /// Disable ownership tracking for this node
    pub fn without_ownership(mut self) -> Self {
        self.ownership = None;
        self
    }

    pub fn cluster(&self) -> &Arc<MemoryCluster> {
        &self.cluster
    }

    pub fn stats(&self) -> MemoryCacheStats {
        MemoryCacheStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            removals: self.counters.removals.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn backend_type(&self) -> CacheBackend {
        CacheBackend::Memory
    }

    async fn get_session_data(
        &self,
        real_id: &str,
        include_attributes: bool,
    ) -> Result<Option<IncomingSessionData>, CacheError> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.cluster.store.get(real_id).map(|stored| IncomingSessionData {
            version: stored.version,
            timestamp: stored.timestamp,
            metadata: stored.metadata.clone(),
            attributes: include_attributes.then(|| stored.attributes.clone()),
        }))
    }

    async fn store_session_data(&self, data: &OutgoingSessionData) -> Result<(), CacheError> {
        let event = match self.cluster.store.entry(data.real_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                stored.version = data.version;
                if let Some(timestamp) = data.timestamp {
                    stored.timestamp = timestamp;
                }
                if let Some(metadata) = &data.metadata {
                    stored.metadata = metadata.clone();
                }
                if let Some(delta) = &data.attributes {
                    delta.apply_to(&mut stored.attributes);
                }
                stored.owner = self.node_id.clone();
                ClusterEvent::SessionChanged {
                    real_id: data.real_id.clone(),
                    origin: self.node_id.clone(),
                    version: stored.version,
                    timestamp: stored.timestamp,
                    metadata: Some(stored.metadata.clone()),
                }
            }
            Entry::Vacant(vacant) => {
                // A first write must carry metadata
                let Some(metadata) = data.metadata.clone() else {
                    return Err(CacheError::NotFound(data.real_id.clone()));
                };
                let mut attributes = AttributeMap::new();
                if let Some(delta) = &data.attributes {
                    delta.apply_to(&mut attributes);
                }
                let stored = StoredSession {
                    version: data.version,
                    timestamp: data.timestamp.unwrap_or(metadata.creation_time),
                    metadata,
                    attributes,
                    owner: self.node_id.clone(),
                };
                let event = ClusterEvent::SessionChanged {
                    real_id: data.real_id.clone(),
                    origin: self.node_id.clone(),
                    version: stored.version,
                    timestamp: stored.timestamp,
                    metadata: Some(stored.metadata.clone()),
                };
                vacant.insert(stored);
                event
            }
        };

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.cluster.publish(event);
        Ok(())
    }

    async fn remove_session(&self, real_id: &str) -> Result<(), CacheError> {
        self.counters.removals.fetch_add(1, Ordering::Relaxed);
        if self.cluster.store.remove(real_id).is_some() {
            self.cluster.publish(ClusterEvent::SessionRemoved {
                real_id: real_id.to_string(),
                origin: self.node_id.clone(),
            });
        }
        Ok(())
    }

    async fn remove_session_local(&self, real_id: &str) -> Result<(), CacheError> {
        self.counters.removals.fetch_add(1, Ordering::Relaxed);
        self.cluster.store.remove(real_id);
        Ok(())
    }

    async fn evict_session(&self, real_id: &str) -> Result<(), CacheError> {
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(node_id = %self.node_id, session_id = %real_id, "Evicted session");
        Ok(())
    }

    async fn session_ids(&self) -> Result<HashMap<String, String>, CacheError> {
        Ok(self
            .cluster
            .store
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().owner.clone()))
            .collect())
    }

    async fn is_local(&self, real_id: &str) -> bool {
        self.cluster.contains(real_id)
    }

    async fn locate(&self, real_id: &str) -> Option<String> {
        self.cluster
            .lock_holder(real_id)
            .or_else(|| self.cluster.store.get(real_id).map(|s| s.owner.clone()))
    }

    fn ownership(&self) -> Option<Arc<dyn SessionOwnership>> {
        self.ownership
            .clone()
            .map(|ownership| ownership as Arc<dyn SessionOwnership>)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ClusterEvent>> {
        Some(self.cluster.events.subscribe())
    }
}

/// Ownership table access for one node
pub struct MemoryOwnership {
    node_id: String,
    cluster: Arc<MemoryCluster>,
}

#[async_trait]
impl SessionOwnership for MemoryOwnership {
    async fn acquire_session_ownership(
        &self,
        real_id: &str,
        new_lock: bool,
    ) -> Result<LockResult, CacheError> {
        loop {
            // Register for wakeups before checking so a release in between is not missed
            let released = self.cluster.lock_released.notified();
            if let Some(result) = self.cluster.try_lock(real_id, &self.node_id, new_lock) {
                return Ok(result);
            }
            released.await;
        }
    }

    async fn relinquish_session_ownership(&self, real_id: &str, remove: bool) -> Result<(), CacheError> {
        self.cluster.unlock(real_id, &self.node_id, remove);
        Ok(())
    }
}
