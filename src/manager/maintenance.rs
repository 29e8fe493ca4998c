//! Periodic maintenance: expiration, purging presumed-expired unloaded entries,
//! and passivation of idle sessions in least-recently-used order.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::metrics::{MaintenanceMetrics, SessionMetrics};
use crate::session::{ClusteredSession, NotificationCause, SessionError};

use super::{MaintenanceReport, SessionManager, StopReport, UnloadedSessionEntry};

enum HotOutcome {
    Expired,
    /// Still alive; carries the last access time for passivation ordering
    Retained(i64),
    Gone,
}

enum PassivationCandidate {
    Hot {
        session: Arc<ClusteredSession>,
        last_update: i64,
    },
    Unloaded {
        real_id: String,
        last_update: i64,
    },
}

impl PassivationCandidate {
    fn last_update(&self) -> i64 {
        match self {
            PassivationCandidate::Hot { last_update, .. }
            | PassivationCandidate::Unloaded { last_update, .. } => *last_update,
        }
    }
}

impl SessionManager {
    /// Run one maintenance pass
    pub async fn tick(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if !self.is_started() {
            return report;
        }

        let start = Instant::now();
        let now = self.now();
        let passivation = self.config.passivation.enabled;
        let mut candidates = Vec::new();

        let hot: Vec<Arc<ClusteredSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in hot {
            match self.check_hot_session(&session, now).await {
                Ok(HotOutcome::Expired) => report.expired += 1,
                Ok(HotOutcome::Retained(last_update)) => {
                    if passivation {
                        candidates.push(PassivationCandidate::Hot {
                            session,
                            last_update,
                        });
                    }
                }
                Ok(HotOutcome::Gone) => {}
                Err(e) => {
                    report.failures += 1;
                    if session.is_timed_out(now).await {
                        if self.record_cleanup_failure(session.real_id(), &e) {
                            report.forced_cleanups += 1;
                        }
                    } else {
                        error!(
                            session_id = %session.real_id(),
                            error = %e,
                            "Failed to process session during maintenance"
                        );
                    }
                }
            }
        }

        let grace_ms = self.config.replication.unloaded_grace_ms();
        let unloaded: Vec<(String, UnloadedSessionEntry)> = self
            .unloaded
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (real_id, entry) in unloaded {
            if entry.is_presumed_expired(now, grace_ms) {
                match self.purge_unloaded(&real_id, &entry).await {
                    Ok(true) => {
                        if entry.passivated {
                            report.expired += 1;
                        } else {
                            report.purged += 1;
                        }
                        self.cleanup_failures.remove(&real_id);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        report.failures += 1;
                        if self.record_cleanup_failure(&real_id, &e) {
                            report.forced_cleanups += 1;
                        }
                    }
                }
            } else if passivation && !entry.passivated {
                candidates.push(PassivationCandidate::Unloaded {
                    real_id,
                    last_update: entry.last_update_time,
                });
            }
        }

        if passivation && !candidates.is_empty() {
            report.passivated = self.passivate_idle(candidates, now).await;
        }

        self.update_gauges();
        MaintenanceMetrics::record_pass(start.elapsed().as_secs_f64(), &report);
        if !report.is_empty() {
            debug!(
                expired = report.expired,
                purged = report.purged,
                passivated = report.passivated,
                failures = report.failures,
                "Maintenance pass completed"
            );
        }
        report
    }

    async fn check_hot_session(
        &self,
        session: &Arc<ClusteredSession>,
        now: i64,
    ) -> Result<HotOutcome, SessionError> {
        let real_id = session.real_id();
        if !session.is_valid().await {
            self.sessions.remove(real_id);
            return Ok(HotOutcome::Gone);
        }

        if session.is_timed_out(now).await {
            if session.is_outdated().await {
                // Another node may have accessed it since our copy was taken
                if self.load_session(real_id).await?.is_none() {
                    self.sessions.remove(real_id);
                    return Ok(HotOutcome::Gone);
                }
                if !session.is_timed_out(now).await {
                    return Ok(HotOutcome::Retained(session.this_accessed_time().await));
                }
            }

            return Ok(
                if self
                    .expire_session(session, true, true, true, NotificationCause::Timeout)
                    .await
                {
                    HotOutcome::Expired
                } else {
                    HotOutcome::Gone
                },
            );
        }

        Ok(HotOutcome::Retained(session.this_accessed_time().await))
    }

    /// Drop an unloaded entry idle past its timeout plus grace
    async fn purge_unloaded(
        &self,
        real_id: &str,
        entry: &UnloadedSessionEntry,
    ) -> Result<bool, SessionError> {
        if entry.passivated {
            // Activate it so expiration runs through the normal path with listeners
            return match self.find_session(real_id, false).await? {
                Some(session) => Ok(self
                    .expire_session(&session, true, true, true, NotificationCause::Timeout)
                    .await),
                None => {
                    self.forget_unloaded(real_id);
                    Ok(true)
                }
            };
        }

        self.cache.remove_session_local(real_id).await?;
        self.forget_unloaded(real_id);
        debug!(session_id = %real_id, "Purged presumed-expired unloaded session");
        Ok(true)
    }

    /// Count a cleanup failure; returns whether the session was force-removed
    fn record_cleanup_failure(&self, real_id: &str, err: &SessionError) -> bool {
        let failures = {
            let mut count = self.cleanup_failures.entry(real_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        MaintenanceMetrics::record_cleanup_failure();

        if failures < self.config.session.cleanup_failure_threshold {
            warn!(
                session_id = %real_id,
                failures = failures,
                error = %err,
                "Failed to clean up expired session, retrying next pass"
            );
            return false;
        }

        warn!(
            session_id = %real_id,
            failures = failures,
            error = %err,
            "Forcing local cleanup of expired session"
        );
        self.cleanup_failures.remove(real_id);
        self.sessions.remove(real_id);
        self.forget_unloaded(real_id);
        MaintenanceMetrics::record_forced_cleanup();

        let cache = self.cache.clone();
        let real_id = real_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = cache.remove_session_local(&real_id).await {
                debug!(session_id = %real_id, error = %e, "Forced cleanup could not reach cache");
            }
        });
        true
    }

    /// Passivate candidates oldest first until neither idle limit applies
    async fn passivate_idle(&self, mut candidates: Vec<PassivationCandidate>, now: i64) -> usize {
        candidates.sort_by_key(PassivationCandidate::last_update);

        let max_idle_seconds = self.config.passivation.max_idle_seconds;
        let min_idle_seconds = self.config.passivation.min_idle_seconds;
        let max_active = self.config.session.max_active().filter(|max| *max > 0);

        let mut passivated = 0;
        for candidate in candidates {
            let idle_ms = now - candidate.last_update();
            let over_max_idle = max_idle_seconds >= 0 && idle_ms > max_idle_seconds * 1000;
            let over_capacity = min_idle_seconds > 0
                && max_active.is_some_and(|max| self.active_count() >= max)
                && idle_ms > min_idle_seconds * 1000;
            if !(over_max_idle || over_capacity) {
                break;
            }

            let done = match candidate {
                PassivationCandidate::Hot { session, .. } => self.passivate_session(&session).await,
                PassivationCandidate::Unloaded { real_id, .. } => {
                    self.passivate_unloaded(&real_id).await
                }
            };
            if done {
                passivated += 1;
            }
        }
        passivated
    }

    /// Write a hot session if needed, then evict it from memory
    async fn passivate_session(&self, session: &Arc<ClusteredSession>) -> bool {
        let real_id = session.real_id().to_string();
        if session.in_use() || !session.is_valid().await {
            return false;
        }

        session.notify_will_passivate(NotificationCause::Passivation);
        if let Err(e) = session.replicate().await {
            warn!(session_id = %real_id, error = %e, "Not passivating session that failed to replicate");
            return false;
        }
        if let Err(e) = self.cache.evict_session(&real_id).await {
            warn!(session_id = %real_id, error = %e, "Failed to evict session");
            return false;
        }

        let entry = UnloadedSessionEntry::passivated(
            session.this_accessed_time().await,
            session.max_inactive_seconds().await,
        );
        self.snapshot.session_removed(&real_id).await;
        self.sessions.remove(&real_id);
        self.unloaded.insert(real_id.clone(), entry);
        self.counters.session_passivated();
        SessionMetrics::record_passivated();

        debug!(session_id = %real_id, "Passivated session");
        true
    }

    /// Release the local copy of a session owned elsewhere
    async fn passivate_unloaded(&self, real_id: &str) -> bool {
        if let Err(e) = self.cache.evict_session(real_id).await {
            warn!(session_id = %real_id, error = %e, "Failed to evict unloaded session");
            return false;
        }

        let newly_passivated = match self.unloaded.get_mut(real_id) {
            Some(mut entry) if !entry.passivated => {
                entry.passivated = true;
                true
            }
            _ => false,
        };
        if newly_passivated {
            self.counters.session_passivated();
            SessionMetrics::record_passivated();
        }
        newly_passivated
    }

    /// Index every session the cluster already holds; returns how many were indexed
    pub(crate) async fn initialize_unloaded_sessions(&self) -> usize {
        let ids = match self.cache.session_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Could not list sessions in distributed cache");
                return 0;
            }
        };

        let now = self.now();
        let mut indexed = 0;
        for (real_id, owner) in ids {
            if self.sessions.contains_key(&real_id) {
                continue;
            }
            let entry = match self.cache.get_session_data(&real_id, false).await {
                Ok(Some(data)) if data.metadata.is_valid => UnloadedSessionEntry::new(
                    Some(owner),
                    data.timestamp,
                    data.metadata.max_inactive_seconds,
                ),
                Ok(_) => continue,
                Err(e) => {
                    debug!(session_id = %real_id, error = %e, "Indexing session without metadata");
                    UnloadedSessionEntry::new(Some(owner), now, self.config.session.max_inactive_seconds)
                }
            };
            self.unloaded.insert(real_id, entry);
            indexed += 1;
        }
        indexed
    }

    /// Release every session on shutdown without deleting cluster data
    pub(crate) async fn clear_sessions(&self) -> StopReport {
        let mut report = StopReport::default();
        let passivation = self.config.passivation.enabled;

        let hot: Vec<Arc<ClusteredSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in hot {
            if passivation && self.passivate_session(&session).await {
                report.passivated += 1;
                continue;
            }
            if session
                .expire(true, false, NotificationCause::Undeploy)
                .await
            {
                report.expired += 1;
            }
            self.snapshot.session_removed(session.real_id()).await;
            self.sessions.remove(session.real_id());
        }

        let unloaded: Vec<(String, bool)> = self
            .unloaded
            .iter()
            .map(|e| (e.key().clone(), e.value().passivated))
            .collect();
        for (real_id, passivated) in unloaded {
            if passivated {
                continue;
            }
            match self.cache.evict_session(&real_id).await {
                Ok(()) => report.unloaded_released += 1,
                Err(e) => debug!(session_id = %real_id, error = %e, "Failed to evict on stop"),
            }
        }

        info!(
            hot_passivated = report.passivated,
            hot_expired = report.expired,
            "Cleared sessions"
        );
        report
    }
}
