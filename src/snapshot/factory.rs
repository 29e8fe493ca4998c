//! Factory for creating snapshot managers

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ReplicationConfig, SnapshotMode};

use super::instant::InstantSnapshotManager;
use super::interval::IntervalSnapshotManager;
use super::SnapshotManager;

/// Create a snapshot manager based on configuration
pub fn create_snapshot_manager(config: &ReplicationConfig) -> Arc<dyn SnapshotManager> {
    match config.snapshot_mode {
        SnapshotMode::Instant => {
            tracing::debug!("Using instant snapshot mode");
            Arc::new(InstantSnapshotManager::new())
        }
        SnapshotMode::Interval => {
            tracing::debug!(
                interval_ms = config.snapshot_interval_ms,
                "Using interval snapshot mode"
            );
            Arc::new(IntervalSnapshotManager::new(Duration::from_millis(
                config.snapshot_interval_ms.max(1),
            )))
        }
    }
}
