//! Integration tests for the session manager on a single node
//!
//! Time is driven by a manual clock and the distributed cache is in-memory,
//! so none of these tests need Redis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

use ara_session_cluster::cache::{
    CacheBackend, CacheError, ClusterEvent, DistributedCache, MemoryDistributedCache,
    SessionOwnership,
};
use ara_session_cluster::clock::{Clock, ManualClock};
use ara_session_cluster::config::{PassivationConfig, ReplicationGranularity};
use ara_session_cluster::manager::{ManagerConfig, SessionManager};
use ara_session_cluster::session::{
    AttributeDelta, AttributeMap, IncomingSessionData, NotificationCause, OutgoingSessionData,
    SessionError, SessionEvent, SessionEventKind, SessionListener,
};
use ara_session_cluster::snapshot::IntervalSnapshotManager;

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
}

struct Node {
    manager: Arc<SessionManager>,
    cache: Arc<MemoryDistributedCache>,
    clock: Arc<ManualClock>,
    listener: Arc<RecordingListener>,
}

async fn start_node(config: ManagerConfig) -> Node {
    let cache = Arc::new(MemoryDistributedCache::standalone("node-a"));
    let clock = Arc::new(ManualClock::default());
    let listener = Arc::new(RecordingListener::default());
    let manager = Arc::new(
        SessionManager::builder(config, cache.clone())
            .clock(clock.clone())
            .listener(listener.clone())
            .build(),
    );
    manager.start().await;
    Node {
        manager,
        cache,
        clock,
        listener,
    }
}

/// In-memory cache whose writes and removals can be switched to fail
struct FailingCache {
    inner: MemoryDistributedCache,
    fail_writes: AtomicBool,
    fail_removals: AtomicBool,
}

impl FailingCache {
    fn new() -> Self {
        Self {
            inner: MemoryDistributedCache::standalone("node-a"),
            fail_writes: AtomicBool::new(false),
            fail_removals: AtomicBool::new(false),
        }
    }

    fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn fail_removals(&self, fail: bool) {
        self.fail_removals.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> Result<(), CacheError> {
        if flag.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DistributedCache for FailingCache {
    fn node_id(&self) -> &str {
        self.inner.node_id()
    }

    fn backend_type(&self) -> CacheBackend {
        self.inner.backend_type()
    }

    async fn get_session_data(
        &self,
        real_id: &str,
        include_attributes: bool,
    ) -> Result<Option<IncomingSessionData>, CacheError> {
        self.inner.get_session_data(real_id, include_attributes).await
    }

    async fn store_session_data(&self, data: &OutgoingSessionData) -> Result<(), CacheError> {
        self.check(&self.fail_writes)?;
        self.inner.store_session_data(data).await
    }

    async fn remove_session(&self, real_id: &str) -> Result<(), CacheError> {
        self.check(&self.fail_removals)?;
        self.inner.remove_session(real_id).await
    }

    async fn remove_session_local(&self, real_id: &str) -> Result<(), CacheError> {
        self.check(&self.fail_removals)?;
        self.inner.remove_session_local(real_id).await
    }

    async fn evict_session(&self, real_id: &str) -> Result<(), CacheError> {
        self.inner.evict_session(real_id).await
    }

    async fn session_ids(&self) -> Result<HashMap<String, String>, CacheError> {
        self.inner.session_ids().await
    }

    async fn is_local(&self, real_id: &str) -> bool {
        self.inner.is_local(real_id).await
    }

    async fn locate(&self, real_id: &str) -> Option<String> {
        self.inner.locate(real_id).await
    }

    fn ownership(&self) -> Option<Arc<dyn SessionOwnership>> {
        self.inner.ownership()
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ClusterEvent>> {
        self.inner.subscribe()
    }
}

struct FailingNode {
    manager: Arc<SessionManager>,
    cache: Arc<FailingCache>,
    clock: Arc<ManualClock>,
}

async fn start_failing_node(
    config: ManagerConfig,
    interval: Option<Arc<IntervalSnapshotManager>>,
) -> FailingNode {
    let cache = Arc::new(FailingCache::new());
    let clock = Arc::new(ManualClock::default());
    let mut builder = SessionManager::builder(config, cache.clone()).clock(clock.clone());
    if let Some(interval) = interval {
        builder = builder.snapshot_manager(interval);
    }
    let manager = Arc::new(builder.build());
    manager.start().await;
    FailingNode {
        manager,
        cache,
        clock,
    }
}

fn attribute_mode() -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.replication.granularity = ReplicationGranularity::Attribute;
    config
}

// =============================================================================
// Dirty tracking and replication
// =============================================================================

mod dirty_tracking_tests {
    use super::*;

    #[tokio::test]
    async fn test_attribute_mode_ships_only_modified_attribute() {
        let node = start_node(attribute_mode()).await;
        let session = assert_ok!(node.manager.create(None).await);
        for name in ["a", "b", "c"] {
            assert_ok!(session.set_attribute(name, json!(1)).await);
        }
        assert!(node.manager.store(&session).await);

        assert_ok!(session.set_attribute("b", json!(2)).await);
        let delta = session.outgoing_delta().await;
        assert!(delta.metadata.is_none());
        match delta.attributes {
            Some(AttributeDelta::Partial { modified, removed }) => {
                assert_eq!(modified.len(), 1);
                assert_eq!(modified.get("b"), Some(&json!(2)));
                assert!(removed.is_empty());
            }
            other => panic!("expected partial delta, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_session_mode_ships_full_map() {
        let node = start_node(ManagerConfig::default()).await;
        let session = assert_ok!(node.manager.create(None).await);
        for name in ["a", "b", "c"] {
            assert_ok!(session.set_attribute(name, json!(1)).await);
        }
        assert!(node.manager.store(&session).await);

        assert_ok!(session.set_attribute("b", json!(2)).await);
        match session.outgoing_delta().await.attributes {
            Some(AttributeDelta::Full { attributes }) => assert_eq!(attributes.len(), 3),
            other => panic!("expected full delta, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_store_without_changes_is_noop() {
        let node = start_node(ManagerConfig::default()).await;
        let session = assert_ok!(node.manager.create(None).await);
        assert_ok!(session.set_attribute("user", json!("alice")).await);

        assert!(node.manager.store(&session).await);
        assert!(!node.manager.store(&session).await);
        assert_eq!(node.cache.stats().writes, 1);
        assert!(!session.is_dirty().await);
    }

    #[tokio::test]
    async fn test_versions_increase_by_one_per_store() {
        let node = start_node(ManagerConfig::default()).await;
        let session = assert_ok!(node.manager.create(Some("counter")).await);
        let initial = session.version().await;

        for n in 1..=5u64 {
            assert_ok!(session.set_attribute("n", json!(n)).await);
            assert!(node.manager.store(&session).await);
            assert_eq!(session.version().await, initial + n);
            assert_eq!(node.cache.cluster().version_of("counter"), Some(initial + n));
        }
    }

    #[tokio::test]
    async fn test_interval_snapshots_coalesce_into_one_write() {
        let cache = Arc::new(MemoryDistributedCache::standalone("node-a"));
        let interval = Arc::new(IntervalSnapshotManager::new(Duration::from_secs(3600)));
        let manager = Arc::new(
            SessionManager::builder(ManagerConfig::default(), cache.clone())
                .snapshot_manager(interval.clone())
                .build(),
        );
        manager.start().await;

        let session = assert_ok!(manager.create(None).await);
        assert_ok!(session.set_attribute("a", json!(1)).await);
        assert!(!manager.store(&session).await);
        assert_ok!(session.set_attribute("a", json!(2)).await);
        assert!(!manager.store(&session).await);
        assert_eq!(cache.stats().writes, 0);

        assert_eq!(interval.flush().await, 1);
        assert_eq!(cache.stats().writes, 1);
        assert_eq!(
            cache.get_session_data(session.real_id(), true).await.unwrap().unwrap().attributes.unwrap().get("a"),
            Some(&json!(2))
        );
    }

    #[tokio::test]
    async fn test_interval_mode_replicates_access_only_timestamp() {
        let mut config = ManagerConfig::default();
        config.replication.max_unreplicated_interval_ms = 0;
        let cache = Arc::new(MemoryDistributedCache::standalone("node-a"));
        let clock = Arc::new(ManualClock::default());
        let interval = Arc::new(IntervalSnapshotManager::new(Duration::from_secs(3600)));
        let manager = Arc::new(
            SessionManager::builder(config, cache.clone())
                .clock(clock.clone())
                .snapshot_manager(interval.clone())
                .build(),
        );
        manager.start().await;
        let t0 = clock.now_ms();

        let mut request = assert_ok!(manager.begin_request().await);
        let session = assert_ok!(request.create(Some("s")).await);
        assert_ok!(session.set_attribute("a", json!(1)).await);
        request.finish().await;
        assert_eq!(interval.flush().await, 1);

        // A request that only reads the session still moves its timestamp
        clock.advance(Duration::from_secs(5));
        let mut request = assert_ok!(manager.begin_request().await);
        assert!(assert_ok!(request.find("s").await).is_some());
        request.finish().await;

        assert_eq!(interval.flush().await, 1);
        assert_eq!(cache.stats().writes, 2);
        let stored = cache.get_session_data("s", false).await.unwrap().unwrap();
        assert_eq!(stored.timestamp, t0 + 5000);
        assert!(!session.must_replicate_timestamp().await);
    }

    #[tokio::test]
    async fn test_interval_timer_writes_once() {
        let mut config = ManagerConfig::default();
        config.replication.snapshot_mode = ara_session_cluster::config::SnapshotMode::Interval;
        config.replication.snapshot_interval_ms = 50;
        let node = start_node(config).await;

        let session = assert_ok!(node.manager.create(None).await);
        assert_ok!(session.set_attribute("a", json!(1)).await);
        node.manager.store(&session).await;
        assert_ok!(session.set_attribute("a", json!(2)).await);
        node.manager.store(&session).await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(node.cache.stats().writes, 1);
        assert_eq!(session.version().await, 1);

        node.manager.stop().await;
    }
}

// =============================================================================
// Capacity and passivation
// =============================================================================

mod capacity_tests {
    use super::*;

    #[tokio::test]
    async fn test_capacity_enforced_until_a_session_expires() {
        let mut config = ManagerConfig::default();
        config.session.max_active_allowed = 2;
        let node = start_node(config).await;

        let first = assert_ok!(node.manager.create(None).await);
        assert_ok!(node.manager.create(None).await);

        let err = assert_err!(node.manager.create(None).await);
        assert!(err.is_capacity_exceeded());
        assert!(matches!(err, SessionError::CapacityExceeded { active: 2, max: 2 }));
        assert_eq!(node.manager.stats().sessions_rejected, 1);

        first.set_max_inactive_seconds(10).await;
        node.clock.advance(Duration::from_secs(11));

        assert_ok!(node.manager.create(None).await);
        assert_eq!(node.manager.active_count(), 2);
        assert!(!first.is_valid().await);
    }

    fn lru_config() -> ManagerConfig {
        let mut config = ManagerConfig::default();
        config.session.max_active_allowed = 3;
        config.passivation = PassivationConfig {
            enabled: true,
            min_idle_seconds: 1,
            max_idle_seconds: -1,
        };
        config
    }

    #[tokio::test]
    async fn test_oldest_hot_session_is_passivated_first() {
        let node = start_node(lru_config()).await;
        let s1 = assert_ok!(node.manager.create(Some("s1")).await);
        node.clock.advance(Duration::from_secs(10));
        assert_ok!(node.manager.create(Some("s2")).await);
        node.clock.advance(Duration::from_secs(10));
        assert_ok!(node.manager.create(Some("s3")).await);
        node.clock.advance(Duration::from_secs(10));

        let report = node.manager.tick().await;
        assert_eq!(report.passivated, 1);
        assert!(!node.manager.is_hot("s1"));
        assert!(node.manager.unloaded_entry("s1").unwrap().passivated);
        assert!(node.manager.is_hot("s2"));
        assert!(node.manager.is_hot("s3"));
        assert_eq!(node.manager.active_count(), 2);

        // The passivated session was written before being evicted
        assert!(node.cache.cluster().contains("s1"));
        assert!(node
            .listener
            .kinds()
            .contains(&(SessionEventKind::WillPassivate, NotificationCause::Passivation)));
        drop(s1);
    }

    #[tokio::test]
    async fn test_oldest_unloaded_entry_is_passivated_first() {
        let node = start_node(lru_config()).await;
        let t0 = node.clock.now_ms();
        node.manager
            .session_changed_in_distributed_cache("remote", "node-b", 1, t0, None)
            .await;
        node.clock.advance(Duration::from_secs(10));
        assert_ok!(node.manager.create(Some("s2")).await);
        node.clock.advance(Duration::from_secs(10));
        assert_ok!(node.manager.create(Some("s3")).await);
        node.clock.advance(Duration::from_secs(10));

        let report = node.manager.tick().await;
        assert_eq!(report.passivated, 1);
        assert!(node.manager.unloaded_entry("remote").unwrap().passivated);
        assert!(node.manager.is_hot("s2"));
        assert!(node.manager.is_hot("s3"));
        assert_eq!(node.cache.stats().evictions, 1);
    }
}

// =============================================================================
// Staleness and lifecycle
// =============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_newer_cluster_version_triggers_reload_on_find() {
        let node = start_node(ManagerConfig::default()).await;
        let session = assert_ok!(node.manager.create(Some("s")).await);
        assert_ok!(session.set_attribute("x", json!("local")).await);
        assert!(node.manager.store(&session).await);
        assert_eq!(session.version().await, 1);

        // Another node writes version 2
        let mut modified = AttributeMap::new();
        modified.insert("x".to_string(), json!("remote"));
        let timestamp = node.clock.now_ms();
        node.cache
            .store_session_data(&OutgoingSessionData {
                real_id: "s".to_string(),
                version: 2,
                timestamp: Some(timestamp),
                metadata: None,
                attributes: Some(AttributeDelta::Partial {
                    modified,
                    removed: vec![],
                }),
            })
            .await
            .unwrap();

        // Same version is not newer
        assert!(!node
            .manager
            .session_changed_in_distributed_cache("s", "node-b", 1, timestamp, None)
            .await);
        assert!(node
            .manager
            .session_changed_in_distributed_cache("s", "node-b", 2, timestamp, None)
            .await);
        assert!(session.is_outdated().await);

        let reads = node.cache.stats().reads;
        let found = assert_ok!(node.manager.find("s").await).unwrap();
        assert_eq!(node.cache.stats().reads, reads + 1);
        assert_eq!(found.version().await, 2);
        assert!(!found.is_outdated().await);
        assert_eq!(assert_ok!(found.get_attribute("x").await), Some(json!("remote")));
    }

    #[tokio::test]
    async fn test_listeners_see_create_and_invalidate() {
        let node = start_node(ManagerConfig::default()).await;
        let session = assert_ok!(node.manager.create(None).await);
        assert_ok!(session.set_attribute("cart", json!({"items": []})).await);
        assert_ok!(node.manager.invalidate(&session).await);

        assert_eq!(
            node.listener.kinds(),
            vec![
                (SessionEventKind::Created, NotificationCause::Create),
                (SessionEventKind::AttributeAdded, NotificationCause::Modify),
                (SessionEventKind::Destroyed, NotificationCause::Invalidate),
                (SessionEventKind::AttributeRemoved, NotificationCause::Invalidate),
            ]
        );
        assert!(matches!(
            session.get_attribute("cart").await,
            Err(SessionError::InvalidSession(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_passivates_and_restart_reindexes() {
        let mut config = ManagerConfig::default();
        config.passivation.enabled = true;
        let node = start_node(config).await;

        let session = assert_ok!(node.manager.create(Some("kept")).await);
        assert_ok!(session.set_attribute("k", json!("v")).await);

        let report = node.manager.stop().await;
        assert_eq!(report.passivated, 1);
        assert!(node.cache.cluster().contains("kept"));
        assert_eq!(node.manager.hot_count(), 0);

        node.manager.start().await;
        assert_eq!(node.manager.unloaded_count(), 1);
        let found = assert_ok!(node.manager.find("kept").await).unwrap();
        assert_eq!(assert_ok!(found.get_attribute("k").await), Some(json!("v")));
    }

    #[tokio::test]
    async fn test_stop_without_passivation_keeps_cluster_data() {
        let node = start_node(ManagerConfig::default()).await;
        let session = assert_ok!(node.manager.create(Some("s")).await);
        node.manager.store(&session).await;

        let report = node.manager.stop().await;
        assert_eq!(report.expired, 1);
        assert!(node.cache.cluster().contains("s"));
        // Undeploy is silent under the default policy
        assert!(!node
            .listener
            .kinds()
            .iter()
            .any(|(kind, _)| *kind == SessionEventKind::Destroyed));
    }

    #[tokio::test]
    async fn test_request_context_stores_on_finish() {
        let node = start_node(ManagerConfig::default()).await;
        let mut request = assert_ok!(node.manager.begin_request().await);
        let session = assert_ok!(request.create(None).await);
        assert_ok!(session.set_attribute("step", json!(1)).await);
        assert!(session.in_use());

        assert_eq!(request.finish().await, 1);
        assert!(!session.in_use());
        assert_eq!(node.manager.stats().requests_in_flight, 0);
    }
}

// =============================================================================
// Cache failures
// =============================================================================

mod cache_failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_store_keeps_session_dirty_for_retry() {
        let node = start_failing_node(ManagerConfig::default(), None).await;
        let session = assert_ok!(node.manager.create(Some("s")).await);
        assert_ok!(session.set_attribute("cart", json!(["book"])).await);
        let initial = session.version().await;

        node.cache.fail_writes(true);
        assert!(!node.manager.store(&session).await);
        assert!(session.is_dirty().await);
        assert_eq!(node.cache.inner.stats().writes, 0);
        assert_eq!(session.version().await, initial);

        node.cache.fail_writes(false);
        assert!(node.manager.store(&session).await);
        assert!(!session.is_dirty().await);
        assert_eq!(node.cache.inner.stats().writes, 1);
        assert_eq!(session.version().await, initial + 1);
    }

    #[tokio::test]
    async fn test_repeated_purge_failures_force_cleanup() {
        let node = start_failing_node(ManagerConfig::default(), None).await;
        let t0 = node.clock.now_ms();
        node.manager
            .session_changed_in_distributed_cache("remote", "node-b", 1, t0, None)
            .await;

        // Past the default timeout plus the unreplicated grace
        node.clock.advance(Duration::from_secs(1800 + 61));
        node.cache.fail_removals(true);

        for _ in 0..2 {
            let report = node.manager.tick().await;
            assert_eq!(report.failures, 1);
            assert_eq!(report.forced_cleanups, 0);
            assert!(node.manager.unloaded_entry("remote").is_some());
        }

        let report = node.manager.tick().await;
        assert_eq!(report.failures, 1);
        assert_eq!(report.forced_cleanups, 1);
        assert!(node.manager.unloaded_entry("remote").is_none());

        // Nothing left to retry
        let report = node.manager.tick().await;
        assert_eq!(report.failures, 0);
    }

    #[tokio::test]
    async fn test_interval_flush_requeues_failed_write() {
        let interval = Arc::new(IntervalSnapshotManager::new(Duration::from_secs(3600)));
        let node = start_failing_node(ManagerConfig::default(), Some(interval.clone())).await;
        let session = assert_ok!(node.manager.create(Some("s")).await);
        assert_ok!(session.set_attribute("a", json!(1)).await);
        assert!(!node.manager.store(&session).await);

        node.cache.fail_writes(true);
        assert_eq!(interval.flush().await, 0);
        assert_eq!(interval.pending_count().await, 1);
        assert!(session.is_dirty().await);

        node.cache.fail_writes(false);
        assert_eq!(interval.flush().await, 1);
        assert_eq!(interval.pending_count().await, 0);
        assert_eq!(node.cache.inner.stats().writes, 1);
        assert!(!session.is_dirty().await);
    }
}
