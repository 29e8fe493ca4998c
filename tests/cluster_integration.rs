//! Multi-node tests over a shared in-memory cluster
//!
//! Each node gets its own `MemoryDistributedCache` handle on one
//! `MemoryCluster`, so writes, removals, ownership and change events behave
//! as they would across processes sharing a cache.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio_test::assert_ok;

use ara_session_cluster::cache::{MemoryCluster, MemoryDistributedCache};
use ara_session_cluster::clock::ManualClock;
use ara_session_cluster::config::PassivationConfig;
use ara_session_cluster::manager::{ManagerConfig, SessionManager};
use ara_session_cluster::session::{
    NotificationCause, SessionError, SessionEvent, SessionEventKind, SessionListener,
};
use ara_session_cluster::tasks::ClusterEventSubscriber;

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<SessionEvent>>,
}

impl SessionListener for RecordingListener {
    fn on_event(&self, event: &SessionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl RecordingListener {
    fn kinds(&self) -> Vec<(SessionEventKind, NotificationCause)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.kind, e.cause))
            .collect()
    }

    fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

struct Node {
    manager: Arc<SessionManager>,
    cache: Arc<MemoryDistributedCache>,
    listener: Arc<RecordingListener>,
}

struct TestCluster {
    cluster: Arc<MemoryCluster>,
    clock: Arc<ManualClock>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TestCluster {
    fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            cluster: MemoryCluster::new(),
            clock: Arc::new(ManualClock::default()),
            shutdown_tx,
        }
    }

    async fn node(&self, node_id: &str, config: ManagerConfig) -> Node {
        let cache = Arc::new(MemoryDistributedCache::new(self.cluster.clone(), node_id));
        let listener = Arc::new(RecordingListener::default());
        let manager = Arc::new(
            SessionManager::builder(config, cache.clone())
                .clock(self.clock.clone())
                .listener(listener.clone())
                .build(),
        );
        manager.start().await;
        Node {
            manager,
            cache,
            listener,
        }
    }

    /// A node that also applies change events published by its peers
    async fn subscribed_node(&self, node_id: &str, config: ManagerConfig) -> Node {
        let node = self.node(node_id, config).await;
        let subscriber =
            ClusterEventSubscriber::for_manager(node.manager.clone(), self.shutdown_tx.subscribe())
                .expect("memory cache publishes events");
        tokio::spawn(subscriber.run());
        node
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Create a session through a request on `node` and finish the request
async fn create_with(node: &Node, id: &str, name: &str, value: serde_json::Value) {
    let mut request = assert_ok!(node.manager.begin_request().await);
    let session = assert_ok!(request.create(Some(id)).await);
    assert_ok!(session.set_attribute(name, value).await);
    assert_eq!(request.finish().await, 1);
}

#[tokio::test]
async fn test_failover_load_on_second_node() {
    let cluster = TestCluster::new();
    let a = cluster.node("node-a", ManagerConfig::default()).await;
    let b = cluster.node("node-b", ManagerConfig::default()).await;

    create_with(&a, "s", "user", json!("alice")).await;

    let mut request = assert_ok!(b.manager.begin_request().await);
    let session = assert_ok!(request.find("s").await).expect("session replicated");
    assert_eq!(assert_ok!(session.get_attribute("user").await), Some(json!("alice")));
    request.finish().await;

    // Failover lifecycle events are suppressed; activation events are not
    assert_eq!(
        b.listener.kinds(),
        vec![(SessionEventKind::DidActivate, NotificationCause::Failover)]
    );
    assert!(b.manager.is_hot("s"));
}

#[tokio::test]
async fn test_remote_write_marks_copy_outdated() {
    let cluster = TestCluster::new();
    let a = cluster.subscribed_node("node-a", ManagerConfig::default()).await;
    let b = cluster.subscribed_node("node-b", ManagerConfig::default()).await;

    create_with(&a, "s", "step", json!(1)).await;
    settle().await;
    // B heard about the session before ever loading it
    assert!(b.manager.unloaded_entry("s").is_some());

    let copy = assert_ok!(b.manager.find("s").await).unwrap();
    assert_eq!(copy.version().await, 1);

    let mut request = assert_ok!(a.manager.begin_request().await);
    let session = assert_ok!(request.find("s").await).unwrap();
    assert_ok!(session.set_attribute("step", json!(2)).await);
    request.finish().await;
    settle().await;

    assert!(copy.is_outdated().await);
    let reads = b.cache.stats().reads;
    let fresh = assert_ok!(b.manager.find("s").await).unwrap();
    assert_eq!(b.cache.stats().reads, reads + 1);
    assert_eq!(fresh.version().await, 2);
    assert_eq!(assert_ok!(fresh.get_attribute("step").await), Some(json!(2)));
}

#[tokio::test]
async fn test_ownership_transfer_refreshes_once() {
    let cluster = TestCluster::new();
    let a = cluster.node("node-a", ManagerConfig::default()).await;
    let b = cluster.node("node-b", ManagerConfig::default()).await;

    create_with(&a, "s", "k", json!("v")).await;
    assert_eq!(cluster.cluster.lock_holder("s"), None);

    let session = assert_ok!(b.manager.find("s").await).unwrap();

    // A last held the lock, so B re-reads on acquisition
    let reads = b.cache.stats().reads;
    assert_ok!(session.access().await);
    assert_eq!(b.cache.stats().reads, reads + 1);
    assert_eq!(cluster.cluster.lock_holder("s").as_deref(), Some("node-b"));
    session.end_access().await;

    // B was the last holder; no refresh this time
    let reads = b.cache.stats().reads;
    assert_ok!(session.access().await);
    assert_eq!(b.cache.stats().reads, reads);
    session.end_access().await;
}

#[tokio::test]
async fn test_ownership_timeout_while_other_node_holds_session() {
    let cluster = TestCluster::new();
    let mut config = ManagerConfig::default();
    config.ownership_timeout_ms = 100;
    let a = cluster.node("node-a", config.clone()).await;
    let b = cluster.node("node-b", config).await;

    create_with(&a, "s", "k", json!("v")).await;

    let mut holding = assert_ok!(a.manager.begin_request().await);
    assert_ok!(holding.find("s").await);

    let mut waiting = assert_ok!(b.manager.begin_request().await);
    let err = waiting.find("s").await.unwrap_err();
    assert!(matches!(err, SessionError::OwnershipAcquisitionFailed { .. }));
    waiting.finish().await;

    holding.finish().await;
    let mut retry = assert_ok!(b.manager.begin_request().await);
    assert!(assert_ok!(retry.find("s").await).is_some());
    retry.finish().await;
}

#[tokio::test]
async fn test_ownership_kept_until_last_local_request_finishes() {
    let cluster = TestCluster::new();
    let mut config = ManagerConfig::default();
    config.ownership_timeout_ms = 100;
    let a = cluster.node("node-a", config.clone()).await;
    let b = cluster.node("node-b", config).await;

    create_with(&a, "s", "k", json!("v")).await;

    let mut first = assert_ok!(a.manager.begin_request().await);
    let mut second = assert_ok!(a.manager.begin_request().await);
    let session = assert_ok!(first.find("s").await).unwrap();
    assert_ok!(second.find("s").await);

    first.finish().await;
    assert!(session.in_use());
    assert_eq!(cluster.cluster.lock_holder("s").as_deref(), Some("node-a"));

    let mut other = assert_ok!(b.manager.begin_request().await);
    let err = other.find("s").await.unwrap_err();
    assert!(matches!(err, SessionError::OwnershipAcquisitionFailed { .. }));
    other.finish().await;

    second.finish().await;
    assert!(!session.in_use());
    assert_eq!(cluster.cluster.lock_holder("s"), None);

    let mut retry = assert_ok!(b.manager.begin_request().await);
    assert!(assert_ok!(retry.find("s").await).is_some());
    retry.finish().await;
}

#[tokio::test]
async fn test_remote_invalidation_is_silent() {
    let cluster = TestCluster::new();
    let a = cluster.subscribed_node("node-a", ManagerConfig::default()).await;
    let b = cluster.subscribed_node("node-b", ManagerConfig::default()).await;

    create_with(&a, "s", "cart", json!(["book"])).await;
    settle().await;
    let copy = assert_ok!(b.manager.find("s").await).unwrap();
    b.listener.clear();

    let session = a.manager.local_session("s").unwrap();
    assert_ok!(a.manager.invalidate(&session).await);
    settle().await;

    assert!(!copy.is_valid().await);
    assert!(!b.manager.is_hot("s"));
    assert!(assert_ok!(b.manager.find("s").await).is_none());
    assert!(b.listener.kinds().is_empty());
    assert!(a
        .listener
        .kinds()
        .contains(&(SessionEventKind::Destroyed, NotificationCause::Invalidate)));
}

#[tokio::test]
async fn test_passivated_session_activates_on_find() {
    let cluster = TestCluster::new();
    let mut config = ManagerConfig::default();
    config.passivation = PassivationConfig {
        enabled: true,
        min_idle_seconds: -1,
        max_idle_seconds: 30,
    };
    let a = cluster.node("node-a", config).await;

    create_with(&a, "s", "theme", json!("dark")).await;
    cluster.clock.advance(Duration::from_secs(31));

    let report = a.manager.tick().await;
    assert_eq!(report.passivated, 1);
    assert_eq!(a.manager.passivated_count(), 1);
    assert!(!a.manager.is_hot("s"));

    let session = assert_ok!(a.manager.find("s").await).unwrap();
    assert_eq!(assert_ok!(session.get_attribute("theme").await), Some(json!("dark")));
    assert_eq!(a.manager.passivated_count(), 0);
    assert_eq!(a.manager.stats().sessions_activated, 1);
    assert!(a
        .listener
        .kinds()
        .contains(&(SessionEventKind::DidActivate, NotificationCause::Activation)));
}

#[tokio::test]
async fn test_abandoned_session_purged_by_surviving_node() {
    let cluster = TestCluster::new();
    let a = cluster.node("node-a", ManagerConfig::default()).await;
    let b = cluster.subscribed_node("node-b", ManagerConfig::default()).await;

    let session = assert_ok!(a.manager.create(Some("s")).await);
    session.set_max_inactive_seconds(10).await;
    assert!(a.manager.store(&session).await);
    settle().await;
    assert_eq!(b.manager.unloaded_entry("s").unwrap().max_inactive_seconds, 10);

    // Node A goes away without stopping; past timeout plus grace B cleans up
    drop(session);
    drop(a);
    cluster.clock.advance(Duration::from_secs(71));

    let report = b.manager.tick().await;
    assert_eq!(report.purged, 1);
    assert!(b.manager.unloaded_entry("s").is_none());
    assert!(!cluster.cluster.contains("s"));
}

#[tokio::test]
async fn test_new_node_indexes_existing_sessions() {
    let cluster = TestCluster::new();
    let a = cluster.node("node-a", ManagerConfig::default()).await;
    create_with(&a, "s1", "n", json!(1)).await;
    create_with(&a, "s2", "n", json!(2)).await;

    let c = cluster.node("node-c", ManagerConfig::default()).await;
    assert_eq!(c.manager.unloaded_count(), 2);
    assert_eq!(c.manager.hot_count(), 0);
    let entry = c.manager.unloaded_entry("s1").unwrap();
    assert_eq!(entry.owner.as_deref(), Some("node-a"));
    assert!(!entry.passivated);
    assert_eq!(c.manager.active_count(), 2);
}
