//! The clustered session record.
//!
//! All mutable state lives behind one per-record lock. Cluster ownership is
//! tracked separately and shared by every local request accessing the session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::cache::LockResult;
use crate::config::{ReplicationGranularity, ReplicationTrigger};
use crate::metrics::ReplicationMetrics;

use super::data::{
    AttributeDelta, AttributeMap, IncomingSessionData, OutgoingSessionData, SessionMetadata,
};
use super::error::SessionError;
use super::id::SessionId;
use super::notification::{NotificationCause, SessionEvent, SessionEventKind};
use super::support::SessionSupport;

#[derive(Debug)]
struct SessionState {
    creation_time: i64,
    max_inactive_seconds: i64,
    is_new: bool,
    is_valid: bool,
    first_access: bool,
    attributes: AttributeMap,
    version: u64,
    last_accessed_time: i64,
    this_accessed_time: i64,
    /// Access time carried by the last successful replication
    timestamp_replicated: i64,
    last_replicated: i64,
    metadata_dirty: bool,
    attributes_dirty: bool,
    modified: AttributeMap,
    removed: HashSet<String>,
    outdated_since: i64,
    full_replication_required: bool,
    full_replication_until: i64,
}

impl SessionState {
    fn new(now: i64, max_inactive_seconds: i64) -> Self {
        Self {
            creation_time: now,
            max_inactive_seconds,
            is_new: false,
            is_valid: false,
            first_access: false,
            attributes: AttributeMap::new(),
            version: 0,
            last_accessed_time: now,
            this_accessed_time: now,
            timestamp_replicated: 0,
            last_replicated: now,
            metadata_dirty: false,
            attributes_dirty: false,
            modified: AttributeMap::new(),
            removed: HashSet::new(),
            outdated_since: 0,
            full_replication_required: true,
            full_replication_until: 0,
        }
    }

    fn is_dirty(&self) -> bool {
        self.metadata_dirty || self.attributes_dirty
    }

    fn always_replicate_timestamp(&self, max_unreplicated_ms: i64) -> bool {
        max_unreplicated_ms == 0
            || (max_unreplicated_ms > 0
                && self.max_inactive_seconds >= 0
                && max_unreplicated_ms > self.max_inactive_seconds * 1000)
    }

    /// An access not yet carried by any replication counts as a touch, even
    /// after `end_access` has rolled the access times forward.
    fn must_replicate_timestamp(&self, max_unreplicated_ms: i64, now: i64) -> bool {
        if self.this_accessed_time == self.timestamp_replicated {
            return false;
        }
        if self.always_replicate_timestamp(max_unreplicated_ms) {
            return true;
        }
        max_unreplicated_ms > 0 && now - self.last_replicated >= max_unreplicated_ms
    }

    fn metadata(&self, real_id: &str) -> SessionMetadata {
        SessionMetadata {
            id: real_id.to_string(),
            creation_time: self.creation_time,
            max_inactive_seconds: self.max_inactive_seconds,
            is_new: self.is_new,
            is_valid: self.is_valid,
        }
    }

    fn mark_attribute_dirty(
        &mut self,
        granularity: ReplicationGranularity,
        name: &str,
        value: &serde_json::Value,
    ) {
        self.attributes_dirty = true;
        if granularity == ReplicationGranularity::Attribute {
            self.modified.insert(name.to_string(), value.clone());
            self.removed.remove(name);
        }
    }

    fn outgoing(
        &self,
        real_id: &str,
        granularity: ReplicationGranularity,
        now: i64,
    ) -> OutgoingSessionData {
        let full = self.full_replication_required || now < self.full_replication_until;

        let attributes = if full || granularity == ReplicationGranularity::Session {
            (self.attributes_dirty || self.full_replication_required).then(|| AttributeDelta::Full {
                attributes: self.attributes.clone(),
            })
        } else if !self.modified.is_empty() || !self.removed.is_empty() {
            let mut removed: Vec<String> = self.removed.iter().cloned().collect();
            removed.sort();
            Some(AttributeDelta::Partial {
                modified: self.modified.clone(),
                removed,
            })
        } else {
            None
        };

        OutgoingSessionData {
            real_id: real_id.to_string(),
            version: self.version + 1,
            timestamp: (self.this_accessed_time != self.timestamp_replicated)
                .then_some(self.this_accessed_time),
            metadata: self.metadata_dirty.then(|| self.metadata(real_id)),
            attributes,
        }
    }

    fn replicated(&mut self, now: i64) {
        self.version += 1;
        self.metadata_dirty = false;
        self.attributes_dirty = false;
        self.modified.clear();
        self.removed.clear();
        self.last_replicated = now;
        self.timestamp_replicated = self.this_accessed_time;
        self.full_replication_required = false;
        if self.full_replication_until != 0 && now >= self.full_replication_until {
            self.full_replication_until = 0;
        }
    }

    fn apply_incoming(&mut self, data: IncomingSessionData, now: i64, window_ms: i64) {
        self.version = data.version;
        self.last_accessed_time = data.timestamp;
        self.this_accessed_time = data.timestamp;
        self.timestamp_replicated = data.timestamp;
        self.creation_time = data.metadata.creation_time;
        self.max_inactive_seconds = data.metadata.max_inactive_seconds;
        self.is_new = data.metadata.is_new;
        self.is_valid = data.metadata.is_valid;
        if let Some(attributes) = data.attributes {
            self.attributes = attributes;
        }
        self.first_access = false;
        self.last_replicated = self.creation_time;
        self.outdated_since = 0;
        self.metadata_dirty = false;
        self.attributes_dirty = false;
        self.modified.clear();
        self.removed.clear();
        self.full_replication_required = true;
        self.full_replication_until = if window_ms > 0 { now + window_ms } else { 0 };
    }
}

/// Read-only view of a session for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub real_id: String,
    pub version: u64,
    pub creation_time: i64,
    pub last_accessed_time: i64,
    pub max_inactive_seconds: i64,
    pub is_new: bool,
    pub is_valid: bool,
    pub outdated: bool,
    pub attribute_count: usize,
}

pub struct ClusteredSession {
    real_id: String,
    support: Arc<SessionSupport>,
    state: Mutex<SessionState>,
    ownership_held: Mutex<bool>,
    access_count: AtomicUsize,
    expiring: AtomicBool,
}

impl std::fmt::Debug for ClusteredSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredSession")
            .field("real_id", &self.real_id)
            .finish_non_exhaustive()
    }
}

impl ClusteredSession {
    /// A brand-new session created by a local request
    pub(crate) fn new_local(real_id: String, support: Arc<SessionSupport>) -> Self {
        let now = support.now_ms();
        let mut state = SessionState::new(now, support.default_max_inactive_seconds);
        state.is_new = true;
        state.is_valid = true;
        state.first_access = true;
        state.metadata_dirty = true;
        Self::with_state(real_id, support, state)
    }

    /// An empty shell to be hydrated from the distributed cache
    pub(crate) fn new_empty(real_id: String, support: Arc<SessionSupport>) -> Self {
        let now = support.now_ms();
        let state = SessionState::new(now, support.default_max_inactive_seconds);
        Self::with_state(real_id, support, state)
    }

    fn with_state(real_id: String, support: Arc<SessionSupport>, state: SessionState) -> Self {
        Self {
            real_id,
            support,
            state: Mutex::new(state),
            ownership_held: Mutex::new(false),
            access_count: AtomicUsize::new(0),
            expiring: AtomicBool::new(false),
        }
    }

    pub fn real_id(&self) -> &str {
        &self.real_id
    }

    /// Client-visible id, carrying this node's route when routing is enabled
    pub fn id(&self) -> String {
        SessionId::with_route(&self.real_id, self.support.jvm_route.as_deref())
    }

    pub async fn version(&self) -> u64 {
        self.state.lock().await.version
    }

    pub async fn creation_time(&self) -> i64 {
        self.state.lock().await.creation_time
    }

    pub async fn last_accessed_time(&self) -> i64 {
        self.state.lock().await.last_accessed_time
    }

    pub async fn this_accessed_time(&self) -> i64 {
        self.state.lock().await.this_accessed_time
    }

    pub async fn max_inactive_seconds(&self) -> i64 {
        self.state.lock().await.max_inactive_seconds
    }

    pub async fn set_max_inactive_seconds(&self, seconds: i64) {
        let mut state = self.state.lock().await;
        if state.max_inactive_seconds != seconds {
            state.max_inactive_seconds = seconds;
            state.metadata_dirty = true;
        }
    }

    pub async fn is_new(&self) -> bool {
        self.state.lock().await.is_new
    }

    pub async fn is_valid(&self) -> bool {
        self.state.lock().await.is_valid
    }

    /// True once a newer version has been observed in the cluster
    pub async fn is_outdated(&self) -> bool {
        self.state.lock().await.outdated_since != 0
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.is_dirty()
    }

    pub async fn must_replicate_timestamp(&self) -> bool {
        let now = self.support.now_ms();
        self.state
            .lock()
            .await
            .must_replicate_timestamp(self.support.replication.max_unreplicated_interval_ms, now)
    }

    /// Whether a store call would write anything
    pub async fn needs_store(&self) -> bool {
        let now = self.support.now_ms();
        let state = self.state.lock().await;
        state.is_valid
            && (state.is_dirty()
                || state.must_replicate_timestamp(
                    self.support.replication.max_unreplicated_interval_ms,
                    now,
                ))
    }

    /// Requests currently holding this session
    pub fn in_use(&self) -> bool {
        self.access_count.load(Ordering::Acquire) > 0
    }

    /// Idle longer than the max-inactive interval and not in use
    pub async fn is_timed_out(&self, now: i64) -> bool {
        if self.in_use() {
            return false;
        }
        let state = self.state.lock().await;
        state.is_valid
            && state.max_inactive_seconds > 0
            && now - state.this_accessed_time >= state.max_inactive_seconds * 1000
    }

    pub async fn metadata(&self) -> SessionMetadata {
        self.state.lock().await.metadata(&self.real_id)
    }

    pub async fn info(&self) -> SessionInfo {
        let state = self.state.lock().await;
        SessionInfo {
            id: self.id(),
            real_id: self.real_id.clone(),
            version: state.version,
            creation_time: state.creation_time,
            last_accessed_time: state.this_accessed_time,
            max_inactive_seconds: state.max_inactive_seconds,
            is_new: state.is_new,
            is_valid: state.is_valid,
            outdated: state.outdated_since != 0,
            attribute_count: state.attributes.len(),
        }
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    pub async fn get_attribute(&self, name: &str) -> Result<Option<serde_json::Value>, SessionError> {
        let mut state = self.state.lock().await;
        self.ensure_valid(&state)?;

        let value = state.attributes.get(name).cloned();
        if let Some(value) = &value {
            let marks_dirty = match self.support.replication.trigger {
                ReplicationTrigger::Set => false,
                ReplicationTrigger::SetAndGet => true,
                ReplicationTrigger::SetAndNonPrimitiveGet => value.is_object() || value.is_array(),
            };
            if marks_dirty {
                state.mark_attribute_dirty(self.support.replication.granularity, name, value);
            }
        }
        Ok(value)
    }

    /// Set an attribute; a `null` value removes it
    pub async fn set_attribute(
        &self,
        name: &str,
        value: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, SessionError> {
        if value.is_null() {
            return self.remove_attribute(name).await;
        }

        let previous = {
            let mut state = self.state.lock().await;
            self.ensure_valid(&state)?;
            state.mark_attribute_dirty(self.support.replication.granularity, name, &value);
            state.attributes.insert(name.to_string(), value)
        };

        let kind = if previous.is_some() {
            SessionEventKind::AttributeReplaced
        } else {
            SessionEventKind::AttributeAdded
        };
        self.support.notify(
            SessionEvent::for_attribute(kind, &self.real_id, NotificationCause::Modify, name),
            true,
        );
        Ok(previous)
    }

    pub async fn remove_attribute(&self, name: &str) -> Result<Option<serde_json::Value>, SessionError> {
        let removed = {
            let mut state = self.state.lock().await;
            self.ensure_valid(&state)?;
            let removed = state.attributes.remove(name);
            if removed.is_some() {
                state.attributes_dirty = true;
                if self.support.replication.granularity == ReplicationGranularity::Attribute {
                    state.modified.remove(name);
                    state.removed.insert(name.to_string());
                }
            }
            removed
        };

        if removed.is_some() {
            self.support.notify(
                SessionEvent::for_attribute(
                    SessionEventKind::AttributeRemoved,
                    &self.real_id,
                    NotificationCause::Modify,
                    name,
                ),
                true,
            );
        }
        Ok(removed)
    }

    pub async fn attribute_names(&self) -> Result<Vec<String>, SessionError> {
        let state = self.state.lock().await;
        self.ensure_valid(&state)?;
        let mut names: Vec<String> = state.attributes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn ensure_valid(&self, state: &SessionState) -> Result<(), SessionError> {
        if state.is_valid {
            Ok(())
        } else {
            Err(SessionError::InvalidSession(self.real_id.clone()))
        }
    }

    // ------------------------------------------------------------------
    // Request lifecycle
    // ------------------------------------------------------------------

    /// Start a request's use of this session: take ownership, then advance the access times
    pub async fn access(&self) -> Result<(), SessionError> {
        {
            let mut held = self.ownership_held.lock().await;
            self.acquire_ownership_locked(&mut held).await?;
            self.access_count.fetch_add(1, Ordering::AcqRel);
        }

        let now = self.support.now_ms();
        let mut state = self.state.lock().await;
        state.last_accessed_time = state.this_accessed_time;
        state.this_accessed_time = now;
        if !state.first_access && state.is_new {
            state.is_new = false;
        }
        Ok(())
    }

    /// Finish a request's use of this session.
    ///
    /// Cluster ownership is handed back only when the last local access ends.
    pub async fn end_access(&self) {
        {
            let mut state = self.state.lock().await;
            state.is_new = false;
            state.last_accessed_time = state.this_accessed_time;
            if state.first_access {
                state.first_access = false;
                state.is_new = true;
            }
        }
        let mut held = self.ownership_held.lock().await;
        let remaining = match self
            .access_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        };
        if remaining == 0 {
            self.release_ownership_locked(&mut held, false).await;
        } else {
            tracing::trace!(
                session_id = %self.real_id,
                remaining = remaining,
                "Keeping ownership for other local requests"
            );
        }
    }

    /// Take cluster-wide ownership; re-entrant while any local access holds it
    pub(crate) async fn acquire_ownership(&self) -> Result<(), SessionError> {
        let mut held = self.ownership_held.lock().await;
        self.acquire_ownership_locked(&mut held).await
    }

    async fn acquire_ownership_locked(&self, held: &mut bool) -> Result<(), SessionError> {
        if !self.support.ownership.is_enabled() || *held {
            return Ok(());
        }

        let new_lock = {
            let state = self.state.lock().await;
            state.first_access && state.is_new
        };

        let result = self.support.ownership.acquire(&self.real_id, new_lock).await?;
        if result == LockResult::AcquiredFromCluster {
            // Another node may have modified the session while it owned it
            match self.support.cache.get_session_data(&self.real_id, true).await {
                Ok(Some(data)) => self.apply_incoming(data).await,
                Ok(None) => {}
                Err(e) => {
                    self.support.ownership.release(&self.real_id, false).await;
                    return Err(SessionError::Cache(e));
                }
            }
        }

        *held = true;
        Ok(())
    }

    pub(crate) async fn release_ownership(&self, remove: bool) {
        let mut held = self.ownership_held.lock().await;
        self.release_ownership_locked(&mut held, remove).await;
    }

    async fn release_ownership_locked(&self, held: &mut bool, remove: bool) {
        if !self.support.ownership.is_enabled() {
            return;
        }
        if *held || remove {
            self.support.ownership.release(&self.real_id, remove).await;
            *held = false;
        }
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// The delta the next replication would ship
    pub async fn outgoing_delta(&self) -> OutgoingSessionData {
        let now = self.support.now_ms();
        self.state
            .lock()
            .await
            .outgoing(&self.real_id, self.support.replication.granularity, now)
    }

    /// Write pending changes to the distributed cache.
    ///
    /// Returns `Ok(false)` when there was nothing to write. On failure the
    /// session stays dirty so a later store retries.
    pub async fn replicate(&self) -> Result<bool, SessionError> {
        let now = self.support.now_ms();
        let mut state = self.state.lock().await;
        let max_unreplicated = self.support.replication.max_unreplicated_interval_ms;
        if !state.is_valid
            || !(state.is_dirty() || state.must_replicate_timestamp(max_unreplicated, now))
        {
            return Ok(false);
        }

        let outgoing = state.outgoing(&self.real_id, self.support.replication.granularity, now);
        let start = Instant::now();
        match self.support.cache.store_session_data(&outgoing).await {
            Ok(()) => {
                state.replicated(now);
                ReplicationMetrics::record_success(start.elapsed().as_secs_f64());
                tracing::trace!(
                    session_id = %self.real_id,
                    version = state.version,
                    "Replicated session"
                );
                Ok(true)
            }
            Err(e) => {
                ReplicationMetrics::record_failure();
                Err(SessionError::ReplicationFailed {
                    id: self.real_id.clone(),
                    source: e,
                })
            }
        }
    }

    /// Overwrite local state with data read from the distributed cache
    pub(crate) async fn apply_incoming(&self, data: IncomingSessionData) {
        let now = self.support.now_ms();
        let window = self.support.replication.full_replication_window_ms;
        self.state.lock().await.apply_incoming(data, now, window);
    }

    /// Record that the cluster holds a newer version; returns whether this copy is now outdated
    pub(crate) async fn mark_outdated(&self, distributed_version: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.version < distributed_version {
            if state.outdated_since == 0 {
                state.outdated_since = self.support.now_ms();
            }
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Expiration and lifecycle events
    // ------------------------------------------------------------------

    /// Invalidate this record and drop its attributes.
    ///
    /// Returns `false` if the session was already invalid or another expiration
    /// is in progress; the caller then has nothing to remove.
    pub(crate) async fn expire(&self, notify: bool, local_call: bool, cause: NotificationCause) -> bool {
        if self.expiring.swap(true, Ordering::AcqRel) {
            return false;
        }
        let expired = self.expire_inner(notify, local_call, cause).await;
        self.expiring.store(false, Ordering::Release);
        expired
    }

    async fn expire_inner(&self, notify: bool, local_call: bool, cause: NotificationCause) -> bool {
        if !self.is_valid().await {
            return false;
        }

        if local_call {
            if let Err(e) = self.acquire_ownership().await {
                tracing::warn!(
                    session_id = %self.real_id,
                    error = %e,
                    "Expiring session without cluster ownership"
                );
            }
        }

        let names = {
            let mut state = self.state.lock().await;
            if !state.is_valid {
                return false;
            }
            let mut names: Vec<String> = state.attributes.drain().map(|(name, _)| name).collect();
            names.sort();
            state.modified.clear();
            state.removed.clear();
            state.is_valid = false;
            state.metadata_dirty = true;
            names
        };

        if notify {
            self.support.notify(
                SessionEvent::new(SessionEventKind::Destroyed, &self.real_id, cause),
                local_call,
            );
            for name in &names {
                self.support.notify(
                    SessionEvent::for_attribute(
                        SessionEventKind::AttributeRemoved,
                        &self.real_id,
                        cause,
                        name,
                    ),
                    local_call,
                );
            }
        }
        true
    }

    pub(crate) fn notify_created(&self, cause: NotificationCause) {
        self.support.notify(
            SessionEvent::new(SessionEventKind::Created, &self.real_id, cause),
            true,
        );
    }

    pub(crate) fn notify_will_passivate(&self, cause: NotificationCause) {
        self.support.notify(
            SessionEvent::new(SessionEventKind::WillPassivate, &self.real_id, cause),
            true,
        );
    }

    pub(crate) fn notify_did_activate(&self, cause: NotificationCause) {
        self.support.notify(
            SessionEvent::new(SessionEventKind::DidActivate, &self.real_id, cause),
            true,
        );
    }
}
