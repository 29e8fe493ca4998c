use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::manager::SessionManager;

/// Background task running the session manager's maintenance pass
pub struct MaintenanceTask {
    manager: Arc<SessionManager>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl MaintenanceTask {
    pub fn new(
        manager: Arc<SessionManager>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            manager,
            interval,
            shutdown,
        }
    }

    /// Run maintenance until shutdown
    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Maintenance task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Maintenance task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.run_pass().await;
                }
            }
        }

        tracing::info!("Maintenance task stopped");
    }

    async fn run_pass(&self) {
        let start = Instant::now();
        let report = self.manager.tick().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if report.failures > 0 {
            tracing::warn!(
                failures = report.failures,
                forced_cleanups = report.forced_cleanups,
                "Maintenance pass had failures"
            );
        }

        // Warn if a pass is taking too long
        if elapsed_ms > self.interval.as_millis() as u64 / 2 {
            tracing::warn!(
                elapsed_ms = elapsed_ms,
                interval_ms = self.interval.as_millis() as u64,
                hot_sessions = self.manager.hot_count(),
                "Maintenance pass took more than 50% of interval"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryDistributedCache;
    use crate::clock::ManualClock;
    use crate::manager::ManagerConfig;

    #[tokio::test]
    async fn test_maintenance_task_shutdown() {
        let cache = Arc::new(MemoryDistributedCache::standalone("node-a"));
        let manager = Arc::new(SessionManager::new(ManagerConfig::default(), cache));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = MaintenanceTask::new(manager, Duration::from_secs(60), shutdown_rx);
        let handle = tokio::spawn(async move {
            task.run().await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Task should complete")
            .expect("Task should not panic");
    }

    #[tokio::test]
    async fn test_maintenance_task_expires_sessions() {
        let cache = Arc::new(MemoryDistributedCache::standalone("node-a"));
        let clock = Arc::new(ManualClock::default());
        let manager = Arc::new(
            SessionManager::builder(ManagerConfig::default(), cache)
                .clock(clock.clone())
                .build(),
        );
        manager.start().await;
        let session = manager.create(None).await.unwrap();
        session.set_max_inactive_seconds(1).await;
        clock.advance(Duration::from_secs(2));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = MaintenanceTask::new(manager.clone(), Duration::from_millis(20), shutdown_rx);
        let handle = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.hot_count(), 0);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
