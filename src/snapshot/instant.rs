use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SnapshotMode;
use crate::session::{ClusteredSession, SessionError};

use super::SnapshotManager;

/// Replicates synchronously on every store
#[derive(Debug, Default)]
pub struct InstantSnapshotManager;

impl InstantSnapshotManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SnapshotManager for InstantSnapshotManager {
    fn mode(&self) -> SnapshotMode {
        SnapshotMode::Instant
    }

    async fn snapshot(&self, session: &Arc<ClusteredSession>) -> Result<bool, SessionError> {
        session.replicate().await
    }

    async fn session_removed(&self, _real_id: &str) {}

    async fn start(&self) {}

    async fn stop(&self) {}
}
