//! Types shared by distributed cache implementations

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionMetadata;

/// Configuration for cluster mode
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Whether cluster mode is enabled
    #[serde(default)]
    pub enabled: bool,
    /// Unique identifier for this node
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Redis key prefix for session data
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Pub/sub channel carrying session change notifications
    #[serde(default = "default_event_channel")]
    pub event_channel: String,
    /// Upper bound on waiting for session ownership, 0 waits forever
    #[serde(default = "default_ownership_timeout")]
    pub ownership_timeout_ms: u64,
    /// Lease on an ownership lock so a crashed node cannot hold a session forever.
    /// A live holder renews it every third of the lease until it releases.
    #[serde(default = "default_lock_lease")]
    pub lock_lease_ms: u64,
}

fn default_node_id() -> String {
    format!("ara-{}", Uuid::new_v4().simple())
}

fn default_key_prefix() -> String {
    "ara:sessions".to_string()
}

fn default_event_channel() -> String {
    "ara:sessions:events".to_string()
}

fn default_ownership_timeout() -> u64 {
    5000
}

fn default_lock_lease() -> u64 {
    30_000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: default_node_id(),
            key_prefix: default_key_prefix(),
            event_channel: default_event_channel(),
            ownership_timeout_ms: default_ownership_timeout(),
            lock_lease_ms: default_lock_lease(),
        }
    }
}

/// Distributed cache backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

impl CacheBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheBackend::Memory => "memory",
            CacheBackend::Redis => "redis",
        }
    }
}

/// Outcome of an ownership acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockResult {
    /// Another node held the session last; local state must be refreshed
    AcquiredFromCluster,
    /// This node already owned the session
    AlreadyHeld,
    /// Ownership record created fresh
    NewLock,
    /// The backend does not track ownership
    Unsupported,
}

impl LockResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockResult::AcquiredFromCluster => "acquired_from_cluster",
            LockResult::AlreadyHeld => "already_held",
            LockResult::NewLock => "new_lock",
            LockResult::Unsupported => "unsupported",
        }
    }
}

/// Change notification broadcast by the distributed cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    SessionChanged {
        real_id: String,
        origin: String,
        version: u64,
        timestamp: i64,
        metadata: Option<SessionMetadata>,
    },
    SessionRemoved {
        real_id: String,
        origin: String,
    },
}

impl ClusterEvent {
    pub fn origin(&self) -> &str {
        match self {
            ClusterEvent::SessionChanged { origin, .. } | ClusterEvent::SessionRemoved { origin, .. } => {
                origin
            }
        }
    }

    pub fn real_id(&self) -> &str {
        match self {
            ClusterEvent::SessionChanged { real_id, .. }
            | ClusterEvent::SessionRemoved { real_id, .. } => real_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ClusterEvent::SessionChanged { .. } => "changed",
            ClusterEvent::SessionRemoved { .. } => "removed",
        }
    }
}

/// Error type for distributed cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session {0} not found in distributed cache")]
    NotFound(String),

    #[error("Invalid session data in distributed cache: {0}")]
    InvalidData(String),

    #[error("Distributed cache unavailable: {0}")]
    Unavailable(String),
}
