//! The session manager: the only component that creates, finds, stores and removes sessions.
//!
//! Hot sessions live in `sessions`. Sessions known to the cluster but not held
//! locally (owned elsewhere, or passivated from here) live in `unloaded`. A
//! session id is never present in both maps at once.

mod config;
mod gate;
mod maintenance;
mod stats;
mod unloaded;

pub use config::ManagerConfig;
pub use gate::{RequestGate, RequestPermit};
pub use stats::{MaintenanceReport, ManagerStats, StopReport};
pub use unloaded::UnloadedSessionEntry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{ClusterEvent, DistributedCache};
use crate::clock::{Clock, SystemClock};
use crate::metrics::SessionMetrics;
use crate::ownership::OwnershipCoordinator;
use crate::request::RequestContext;
use crate::session::{
    ClusteredSession, NotificationCause, NotificationPolicy, SessionError, SessionId,
    SessionListener, SessionMetadata, SessionSupport,
};
use crate::snapshot::{create_snapshot_manager, SnapshotManager};

use stats::ManagerCounters;

pub struct SessionManager {
    config: ManagerConfig,
    support: Arc<SessionSupport>,
    cache: Arc<dyn DistributedCache>,
    snapshot: Arc<dyn SnapshotManager>,
    sessions: DashMap<String, Arc<ClusteredSession>>,
    unloaded: DashMap<String, UnloadedSessionEntry>,
    /// Per-id guards so concurrent finds of one session load it once
    loading: DashMap<String, Arc<Mutex<()>>>,
    cleanup_failures: DashMap<String, u32>,
    gate: RequestGate,
    started: AtomicBool,
    counters: ManagerCounters,
}

pub struct SessionManagerBuilder {
    config: ManagerConfig,
    cache: Arc<dyn DistributedCache>,
    clock: Arc<dyn Clock>,
    listeners: Vec<Arc<dyn SessionListener>>,
    snapshot: Option<Arc<dyn SnapshotManager>>,
}

impl SessionManagerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Override the snapshot manager chosen from the replication config
    pub fn snapshot_manager(mut self, snapshot: Arc<dyn SnapshotManager>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn build(self) -> SessionManager {
        let ownership =
            OwnershipCoordinator::for_cache(self.cache.as_ref(), self.config.ownership_timeout_ms);
        let support = Arc::new(SessionSupport {
            cache: self.cache.clone(),
            ownership,
            clock: self.clock,
            replication: self.config.replication.clone(),
            policy: NotificationPolicy::new(self.config.replication.notification_policy),
            listeners: self.listeners,
            jvm_route: self.config.jvm_route.clone(),
            default_max_inactive_seconds: self.config.session.max_inactive_seconds,
        });
        let snapshot = self
            .snapshot
            .unwrap_or_else(|| create_snapshot_manager(&self.config.replication));

        SessionManager {
            config: self.config,
            support,
            cache: self.cache,
            snapshot,
            sessions: DashMap::new(),
            unloaded: DashMap::new(),
            loading: DashMap::new(),
            cleanup_failures: DashMap::new(),
            gate: RequestGate::new(),
            started: AtomicBool::new(false),
            counters: ManagerCounters::default(),
        }
    }
}

impl SessionManager {
    pub fn new(config: ManagerConfig, cache: Arc<dyn DistributedCache>) -> Self {
        Self::builder(config, cache).build()
    }

    pub fn builder(config: ManagerConfig, cache: Arc<dyn DistributedCache>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            cache,
            clock: Arc::new(SystemClock),
            listeners: Vec::new(),
            snapshot: None,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        self.cache.node_id()
    }

    pub fn cache(&self) -> &Arc<dyn DistributedCache> {
        &self.cache
    }

    pub fn snapshot_manager(&self) -> &Arc<dyn SnapshotManager> {
        &self.snapshot
    }

    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn now(&self) -> i64 {
        self.support.now_ms()
    }

    /// Strip the route suffix from a client-visible id
    pub fn real_id(&self, id: &str) -> String {
        SessionId::parse(id, self.config.jvm_route.is_some()).into_real_id()
    }

    // ------------------------------------------------------------------
    // Counts
    // ------------------------------------------------------------------

    pub fn hot_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn unloaded_count(&self) -> usize {
        self.unloaded.len()
    }

    pub fn passivated_count(&self) -> usize {
        self.counters.passivated()
    }

    /// Sessions counted against the capacity limit: hot plus unloaded, minus passivated
    pub fn active_count(&self) -> usize {
        (self.sessions.len() + self.unloaded.len()).saturating_sub(self.counters.passivated())
    }

    pub fn local_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn unloaded_entry(&self, real_id: &str) -> Option<UnloadedSessionEntry> {
        self.unloaded.get(real_id).map(|e| e.value().clone())
    }

    pub fn is_hot(&self, real_id: &str) -> bool {
        self.sessions.contains_key(real_id)
    }

    /// The hot copy of a session, without loading or accessing it
    pub fn local_session(&self, real_id: &str) -> Option<Arc<ClusteredSession>> {
        self.sessions.get(real_id).map(|e| e.value().clone())
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            node_id: self.node_id().to_string(),
            hot_sessions: self.hot_count(),
            unloaded_sessions: self.unloaded_count(),
            passivated_sessions: self.passivated_count(),
            max_passivated_sessions: self.counters.max_passivated.load(Ordering::Relaxed),
            active_sessions: self.active_count(),
            max_active_allowed: self.config.session.max_active(),
            sessions_created: self.counters.created.load(Ordering::Relaxed),
            sessions_expired: self.counters.expired.load(Ordering::Relaxed),
            sessions_rejected: self.counters.rejected.load(Ordering::Relaxed),
            sessions_activated: self.counters.activated.load(Ordering::Relaxed),
            requests_in_flight: self.gate.in_flight(),
        }
    }

    fn update_gauges(&self) {
        SessionMetrics::set_counts(self.hot_count(), self.unloaded_count(), self.passivated_count());
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Index the sessions already in the cluster and start admitting requests
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let indexed = self.initialize_unloaded_sessions().await;
        if self.config.passivation.enabled {
            // Passivate whatever the restart left above the limits
            self.tick().await;
        }
        self.snapshot.start().await;
        self.gate.open().await;
        self.update_gauges();

        info!(
            node_id = %self.node_id(),
            unloaded = indexed,
            snapshot_mode = ?self.snapshot.mode(),
            "Session manager started"
        );
    }

    /// Drain in-flight requests, then passivate or locally expire every session
    pub async fn stop(&self) -> StopReport {
        if !self.is_started() {
            return StopReport::default();
        }

        info!(node_id = %self.node_id(), "Stopping session manager");
        self.gate.close().await;
        self.started.store(false, Ordering::Release);

        let report = self.clear_sessions().await;
        self.snapshot.stop().await;

        self.sessions.clear();
        self.unloaded.clear();
        self.loading.clear();
        self.cleanup_failures.clear();
        self.counters.passivated.store(0, Ordering::Release);
        self.update_gauges();

        info!(
            passivated = report.passivated,
            expired = report.expired,
            unloaded_released = report.unloaded_released,
            "Session manager stopped"
        );
        report
    }

    /// Enter the request gate and open a request context
    pub async fn begin_request(self: &Arc<Self>) -> Result<RequestContext, SessionError> {
        let permit = self.gate.enter().await?;
        Ok(RequestContext::new(self.clone(), permit))
    }

    // ------------------------------------------------------------------
    // Create / find
    // ------------------------------------------------------------------

    /// Create a session, generating an id when none is given
    pub async fn create(&self, id: Option<&str>) -> Result<Arc<ClusteredSession>, SessionError> {
        if !self.is_started() {
            return Err(SessionError::NotAcceptingRequests);
        }
        self.ensure_capacity().await?;

        let real_id = match id {
            Some(id) => self.real_id(id),
            None => SessionId::generate(),
        };
        let session = Arc::new(ClusteredSession::new_local(real_id, self.support.clone()));
        self.add(session.clone()).await;

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        SessionMetrics::record_created();
        session.notify_created(NotificationCause::Create);

        debug!(session_id = %session.real_id(), "Created session");
        Ok(session)
    }

    /// Reject creation when the active count is at the limit, after one maintenance pass
    async fn ensure_capacity(&self) -> Result<(), SessionError> {
        let Some(max) = self.config.session.max_active() else {
            return Ok(());
        };
        if self.active_count() < max {
            return Ok(());
        }

        self.tick().await;
        let active = self.active_count();
        if active < max {
            return Ok(());
        }

        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        SessionMetrics::record_rejected();
        warn!(active = active, max = max, "Session creation rejected, too many active sessions");
        Err(SessionError::CapacityExceeded { active, max })
    }

    /// Find a session by client-visible id, loading it from the cluster if needed
    pub async fn find(&self, id: &str) -> Result<Option<Arc<ClusteredSession>>, SessionError> {
        self.find_session(id, false).await
    }

    /// `skip_load` suppresses loading for ids the current request already invalidated
    pub(crate) async fn find_session(
        &self,
        id: &str,
        skip_load: bool,
    ) -> Result<Option<Arc<ClusteredSession>>, SessionError> {
        let real_id = self.real_id(id);
        let hot = self.sessions.get(&real_id).map(|e| e.value().clone());

        match hot {
            Some(session) => {
                if session.is_outdated().await {
                    let reloaded = self.load_session(&real_id).await?;
                    if reloaded.is_none() {
                        debug!(session_id = %real_id, "Outdated session no longer in cluster");
                        self.sessions.remove(&real_id);
                        self.update_gauges();
                    }
                    return Ok(reloaded);
                }
                if !session.is_valid().await {
                    return Ok(None);
                }
                Ok(Some(session))
            }
            None if skip_load => Ok(None),
            None => self.load_session(&real_id).await,
        }
    }

    /// Load a session from the distributed cache, coalescing concurrent loads of one id
    pub(crate) async fn load_session(
        &self,
        real_id: &str,
    ) -> Result<Option<Arc<ClusteredSession>>, SessionError> {
        let guard = self
            .loading
            .entry(real_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _loading = guard.lock().await;
            self.load_session_locked(real_id).await
        };

        drop(guard);
        self.loading.remove_if(real_id, |_, guard| Arc::strong_count(guard) == 1);
        result
    }

    async fn load_session_locked(
        &self,
        real_id: &str,
    ) -> Result<Option<Arc<ClusteredSession>>, SessionError> {
        let existing = self.sessions.get(real_id).map(|e| e.value().clone());
        if let Some(session) = &existing {
            // Loaded by a concurrent caller while we waited
            if !session.is_outdated().await {
                return Ok(Some(session.clone()));
            }
        }

        let passivated = self.unloaded.get(real_id).map(|e| e.passivated).unwrap_or(false);
        let start = Instant::now();
        let Some(data) = self.cache.get_session_data(real_id, true).await? else {
            debug!(session_id = %real_id, "Session not found in distributed cache");
            return Ok(None);
        };
        if !data.metadata.is_valid {
            return Ok(None);
        }

        let initial = existing.is_none();
        let session = existing.unwrap_or_else(|| {
            Arc::new(ClusteredSession::new_empty(real_id.to_string(), self.support.clone()))
        });
        let version = data.version;
        session.apply_incoming(data).await;

        let cause = if passivated {
            NotificationCause::Activation
        } else {
            NotificationCause::Failover
        };
        session.notify_did_activate(cause);

        if initial {
            self.add(session.clone()).await;
            if passivated {
                self.counters.session_activated();
                SessionMetrics::record_activated();
            } else {
                session.notify_created(NotificationCause::Failover);
            }
        }

        SessionMetrics::record_load(start.elapsed().as_secs_f64());
        debug!(
            session_id = %real_id,
            version = version,
            cause = ?cause,
            "Loaded session from distributed cache"
        );
        Ok(Some(session))
    }

    /// Register a valid session as hot, dropping any unloaded entry for it
    pub(crate) async fn add(&self, session: Arc<ClusteredSession>) {
        if !session.is_valid().await {
            debug!(session_id = %session.real_id(), "Ignoring invalid session");
            return;
        }
        let real_id = session.real_id().to_string();
        self.unloaded.remove(&real_id);
        self.sessions.insert(real_id, session);
        self.update_gauges();
    }

    // ------------------------------------------------------------------
    // Store / remove
    // ------------------------------------------------------------------

    /// Hand a session to the snapshot manager at the end of a request.
    ///
    /// Returns whether the cache was written during this call. Replication
    /// failures are logged; the session stays dirty and is retried next time.
    pub async fn store(&self, session: &Arc<ClusteredSession>) -> bool {
        if !session.needs_store().await {
            return false;
        }

        match self.snapshot.snapshot(session).await {
            Ok(written) => written,
            Err(e) => {
                warn!(
                    session_id = %session.real_id(),
                    error = %e,
                    "Failed to replicate session"
                );
                false
            }
        }
    }

    /// Remove a session from this node and from the cluster
    pub async fn remove(&self, session: &ClusteredSession) {
        self.remove_internal(session, false).await;
    }

    /// Remove a session from this node, leaving other nodes' copies untouched
    pub async fn remove_local(&self, session: &ClusteredSession) {
        self.remove_internal(session, true).await;
    }

    async fn remove_internal(&self, session: &ClusteredSession, local_only: bool) {
        let real_id = session.real_id();
        let result = if local_only {
            self.cache.remove_session_local(real_id).await
        } else {
            self.cache.remove_session(real_id).await
        };
        if let Err(e) = result {
            warn!(
                session_id = %real_id,
                local_only = local_only,
                error = %e,
                "Failed to remove session from distributed cache"
            );
        }

        self.snapshot.session_removed(real_id).await;
        self.sessions.remove(real_id);
        self.forget_unloaded(real_id);
        self.cleanup_failures.remove(real_id);

        self.counters.expired.fetch_add(1, Ordering::Relaxed);
        SessionMetrics::record_expired();
        self.update_gauges();
    }

    /// Expire a session record and, for local calls, remove it from the manager and cache
    pub(crate) async fn expire_session(
        &self,
        session: &Arc<ClusteredSession>,
        notify: bool,
        local_call: bool,
        local_only: bool,
        cause: NotificationCause,
    ) -> bool {
        if !session.expire(notify, local_call, cause).await {
            return false;
        }
        if local_call {
            self.remove_internal(session, local_only).await;
            session.release_ownership(true).await;
        }
        debug!(session_id = %session.real_id(), cause = ?cause, "Expired session");
        true
    }

    /// Invalidate a session everywhere in the cluster
    pub async fn invalidate(&self, session: &Arc<ClusteredSession>) -> Result<(), SessionError> {
        if !session.is_valid().await {
            return Err(SessionError::InvalidSession(session.real_id().to_string()));
        }
        self.expire_session(session, true, true, false, NotificationCause::Invalidate)
            .await;
        Ok(())
    }

    fn forget_unloaded(&self, real_id: &str) {
        if let Some((_, entry)) = self.unloaded.remove(real_id) {
            if entry.passivated {
                self.counters.passivation_released();
            }
        }
    }

    // ------------------------------------------------------------------
    // Cluster notifications
    // ------------------------------------------------------------------

    /// Another node wrote a session.
    ///
    /// A hot copy is marked outdated when the written version is newer; an id
    /// not held here is indexed as unloaded. Returns whether anything changed.
    pub async fn session_changed_in_distributed_cache(
        &self,
        real_id: &str,
        owner: &str,
        version: u64,
        timestamp: i64,
        metadata: Option<&SessionMetadata>,
    ) -> bool {
        let hot = self.sessions.get(real_id).map(|e| e.value().clone());
        if let Some(session) = hot {
            let outdated = session.mark_outdated(version).await;
            if outdated {
                debug!(
                    session_id = %real_id,
                    owner = %owner,
                    version = version,
                    "Local session copy is outdated"
                );
            }
            return outdated;
        }

        if metadata.is_some_and(|m| !m.is_valid) {
            self.forget_unloaded(real_id);
            self.update_gauges();
            return false;
        }

        let max_inactive = metadata
            .map(|m| m.max_inactive_seconds)
            .unwrap_or(self.config.session.max_inactive_seconds);
        let entry = UnloadedSessionEntry::new(Some(owner.to_string()), timestamp, max_inactive);
        if let Some(previous) = self.unloaded.insert(real_id.to_string(), entry) {
            if previous.passivated {
                // Another node took the session over; it is no longer passivated here
                self.counters.passivation_released();
            }
        }
        self.update_gauges();
        true
    }

    /// Another node invalidated a session; drop any local copy without notifying listeners
    pub async fn notify_remote_invalidation(&self, real_id: &str) {
        if let Some((_, session)) = self.sessions.remove(real_id) {
            self.snapshot.session_removed(real_id).await;
            session
                .expire(true, false, NotificationCause::Invalidate)
                .await;
            debug!(session_id = %real_id, "Session invalidated by another node");
        }
        self.forget_unloaded(real_id);
        self.update_gauges();
    }

    /// Apply a cluster event published by another node
    pub async fn handle_cluster_event(&self, event: &ClusterEvent) {
        if event.origin() == self.node_id() {
            return;
        }
        match event {
            ClusterEvent::SessionChanged {
                real_id,
                origin,
                version,
                timestamp,
                metadata,
            } => {
                self.session_changed_in_distributed_cache(
                    real_id,
                    origin,
                    *version,
                    *timestamp,
                    metadata.as_ref(),
                )
                .await;
            }
            ClusterEvent::SessionRemoved { real_id, .. } => {
                self.notify_remote_invalidation(real_id).await;
            }
        }
    }
}
