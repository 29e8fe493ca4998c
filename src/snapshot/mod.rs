//! Snapshot scheduling: when a stored session is actually written to the cache.
//!
//! - `InstantSnapshotManager`: writes synchronously inside `store`
//! - `IntervalSnapshotManager`: collects sessions and flushes them on a timer

mod factory;
mod instant;
mod interval;

pub use factory::create_snapshot_manager;
pub use instant::InstantSnapshotManager;
pub use interval::IntervalSnapshotManager;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SnapshotMode;
use crate::session::{ClusteredSession, SessionError};

#[async_trait]
pub trait SnapshotManager: Send + Sync {
    fn mode(&self) -> SnapshotMode;

    /// Replicate now or schedule replication; returns whether a write happened immediately
    async fn snapshot(&self, session: &Arc<ClusteredSession>) -> Result<bool, SessionError>;

    /// Drop any pending work for a removed session
    async fn session_removed(&self, real_id: &str);

    async fn start(&self);

    /// Stop scheduling; pending snapshots are discarded
    async fn stop(&self);
}
