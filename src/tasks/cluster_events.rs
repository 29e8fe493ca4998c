use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};

use crate::cache::ClusterEvent;
use crate::manager::SessionManager;
use crate::metrics::ClusterEventMetrics;

/// Feeds change notifications from the distributed cache into the session manager
pub struct ClusterEventSubscriber {
    manager: Arc<SessionManager>,
    events: broadcast::Receiver<ClusterEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl ClusterEventSubscriber {
    pub fn new(
        manager: Arc<SessionManager>,
        events: broadcast::Receiver<ClusterEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            manager,
            events,
            shutdown,
        }
    }

    /// Subscribe to the manager's own cache; `None` if the cache publishes no events
    pub fn for_manager(
        manager: Arc<SessionManager>,
        shutdown: broadcast::Receiver<()>,
    ) -> Option<Self> {
        let events = manager.cache().subscribe()?;
        Some(Self::new(manager, events, shutdown))
    }

    pub async fn run(mut self) {
        tracing::info!(node_id = %self.manager.node_id(), "Cluster event subscriber started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Cluster event subscriber received shutdown signal");
                    break;
                }
                event = self.events.recv() => {
                    match event {
                        Ok(event) => self.handle(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            ClusterEventMetrics::record_lagged(skipped);
                            tracing::warn!(
                                skipped = skipped,
                                "Cluster event subscriber lagged, local copies may be stale"
                            );
                        }
                        Err(RecvError::Closed) => {
                            tracing::warn!("Cluster event channel closed");
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Cluster event subscriber stopped");
    }

    async fn handle(&self, event: ClusterEvent) {
        if event.origin() == self.manager.node_id() {
            return;
        }
        ClusterEventMetrics::record_received(event.event_type());
        tracing::trace!(
            session_id = %event.real_id(),
            origin = %event.origin(),
            event_type = event.event_type(),
            "Received cluster event"
        );
        self.manager.handle_cluster_event(&event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCluster, MemoryDistributedCache};
    use crate::manager::ManagerConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_remote_writes_reach_manager() {
        let cluster = MemoryCluster::new();
        let cache_a = Arc::new(MemoryDistributedCache::new(cluster.clone(), "node-a"));
        let cache_b = Arc::new(MemoryDistributedCache::new(cluster, "node-b"));
        let manager_a = Arc::new(SessionManager::new(ManagerConfig::default(), cache_a));
        let manager_b = Arc::new(SessionManager::new(ManagerConfig::default(), cache_b));
        manager_a.start().await;
        manager_b.start().await;

        let (shutdown_tx, _) = broadcast::channel(1);
        let subscriber =
            ClusterEventSubscriber::for_manager(manager_b.clone(), shutdown_tx.subscribe()).unwrap();
        let handle = tokio::spawn(subscriber.run());

        let session = manager_a.create(Some("shared")).await.unwrap();
        manager_a.store(&session).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let entry = manager_b.unloaded_entry("shared").unwrap();
        assert_eq!(entry.owner.as_deref(), Some("node-a"));

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
