//! Graceful shutdown handling for the session cluster node.
//!
//! The shutdown sequence:
//! 1. Signals background tasks (maintenance, cluster events) to stop
//! 2. Waits for in-flight requests to leave the request gate
//! 3. Stops the session manager, passivating or releasing every local session

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::manager::{SessionManager, StopReport};

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for in-flight requests to finish (default: 10 seconds)
    pub drain_timeout: Duration,
    /// Time to wait for the session manager to release its sessions (default: 15 seconds)
    pub stop_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(15),
        }
    }
}

/// Handles graceful shutdown of the session cluster node
pub struct GracefulShutdown {
    manager: Arc<SessionManager>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    /// Create a new graceful shutdown handler
    pub fn new(manager: Arc<SessionManager>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self::with_config(manager, shutdown_tx, ShutdownConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(
        manager: Arc<SessionManager>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            manager,
            shutdown_tx,
            config,
        }
    }

    /// Execute graceful shutdown sequence
    ///
    /// Returns a ShutdownResult with details about the shutdown process
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(hot_sessions = self.manager.hot_count())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        // Phase 1: Signal background tasks to stop
        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Signaling background tasks");
        let _ = self.shutdown_tx.send(());

        // Phase 2: Wait for in-flight requests
        tracing::info!("Phase 2: Draining in-flight requests");
        result.requests_drained = self.wait_for_requests().await;

        // Phase 3: Release sessions
        tracing::info!("Phase 3: Stopping session manager");
        match timeout(self.config.stop_timeout, self.manager.stop()).await {
            Ok(report) => {
                result.stop = report;
                result.success = true;
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.config.stop_timeout.as_secs(),
                    "Session manager did not stop in time"
                );
            }
        }

        result.duration = start.elapsed();

        tracing::info!(
            requests_drained = result.requests_drained,
            passivated = result.stop.passivated,
            expired = result.stop.expired,
            unloaded_released = result.stop.unloaded_released,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    /// Wait until no request holds a gate permit
    async fn wait_for_requests(&self) -> bool {
        let initial = self.manager.gate().in_flight();
        if initial == 0 {
            return true;
        }

        tracing::info!(in_flight = initial, "Waiting for in-flight requests");
        let gate = self.manager.gate();
        let wait_future = async {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if gate.in_flight() == 0 {
                    break;
                }
            }
        };

        match timeout(self.config.drain_timeout, wait_future).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    remaining = gate.in_flight(),
                    "Some requests did not finish before the drain timeout"
                );
                false
            }
        }
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether the session manager stopped within its timeout
    pub success: bool,
    /// Whether every in-flight request finished before the drain timeout
    pub requests_drained: bool,
    pub stop: StopReport,
    /// Total time taken for shutdown
    pub duration: Duration,
}
