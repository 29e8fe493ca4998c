use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::SnapshotMode;
use crate::session::{ClusteredSession, SessionError};

use super::SnapshotManager;

type PendingSessions = Arc<Mutex<HashMap<String, Arc<ClusteredSession>>>>;

/// Batches replication: sessions stored within one interval are written once at the next tick
pub struct IntervalSnapshotManager {
    interval: Duration,
    pending: PendingSessions,
    shutdown: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IntervalSnapshotManager {
    pub fn new(interval: Duration) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            interval,
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            worker: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Write every pending session now; returns how many were written
    pub async fn flush(&self) -> usize {
        flush_pending(&self.pending).await
    }
}

async fn flush_pending(pending: &PendingSessions) -> usize {
    let batch = std::mem::take(&mut *pending.lock().await);
    if batch.is_empty() {
        return 0;
    }

    let mut written = 0;
    for (real_id, session) in batch {
        match session.replicate().await {
            Ok(true) => written += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    session_id = %real_id,
                    error = %e,
                    "Interval snapshot failed, retrying on next tick"
                );
                pending.lock().await.entry(real_id).or_insert(session);
            }
        }
    }

    tracing::debug!(written = written, "Interval snapshot flushed");
    written
}

#[async_trait]
impl SnapshotManager for IntervalSnapshotManager {
    fn mode(&self) -> SnapshotMode {
        SnapshotMode::Interval
    }

    async fn snapshot(&self, session: &Arc<ClusteredSession>) -> Result<bool, SessionError> {
        self.pending
            .lock()
            .await
            .insert(session.real_id().to_string(), session.clone());
        Ok(false)
    }

    async fn session_removed(&self, real_id: &str) {
        self.pending.lock().await.remove(real_id);
    }

    async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }

        let pending = self.pending.clone();
        let period = self.interval;
        let mut shutdown = self.shutdown.subscribe();

        *worker = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            // Skip immediate first tick
            timer.tick().await;

            tracing::info!(interval_ms = period.as_millis() as u64, "Interval snapshot task started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = timer.tick() => {
                        flush_pending(&pending).await;
                    }
                }
            }
            tracing::info!("Interval snapshot task stopped");
        }));
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Interval snapshot task ended abnormally");
            }
        }

        let discarded = {
            let mut pending = self.pending.lock().await;
            let count = pending.len();
            pending.clear();
            count
        };
        if discarded > 0 {
            tracing::debug!(discarded = discarded, "Discarded pending snapshots on stop");
        }
    }
}
