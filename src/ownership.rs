//! Cluster-wide ownership of sessions.
//!
//! Wraps the optional ownership capability of the distributed cache with an
//! acquisition timeout and metrics. Re-entrancy within one access cycle and the
//! refresh after a remote acquisition are handled by the session record.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::cache::{DistributedCache, LockResult, SessionOwnership};
use crate::metrics::OwnershipMetrics;
use crate::session::SessionError;

pub struct OwnershipCoordinator {
    backend: Option<Arc<dyn SessionOwnership>>,
    timeout: Option<Duration>,
}

impl OwnershipCoordinator {
    pub fn new(backend: Option<Arc<dyn SessionOwnership>>, timeout: Option<Duration>) -> Self {
        Self { backend, timeout }
    }

    /// Coordinator over the cache's ownership support; `timeout_ms == 0` waits forever
    pub fn for_cache(cache: &dyn DistributedCache, timeout_ms: u64) -> Self {
        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        Self::new(cache.ownership(), timeout)
    }

    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub async fn acquire(&self, real_id: &str, new_lock: bool) -> Result<LockResult, SessionError> {
        let Some(backend) = &self.backend else {
            return Ok(LockResult::Unsupported);
        };

        let pending = backend.acquire_session_ownership(real_id, new_lock);
        let outcome = match self.timeout {
            Some(limit) => match timeout(limit, pending).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    OwnershipMetrics::record_failure("timeout");
                    tracing::warn!(
                        session_id = %real_id,
                        timeout_ms = limit.as_millis() as u64,
                        "Timed out acquiring session ownership"
                    );
                    return Err(SessionError::OwnershipAcquisitionFailed {
                        id: real_id.to_string(),
                        reason: format!("timed out after {}ms", limit.as_millis()),
                    });
                }
            },
            None => pending.await,
        };

        match outcome {
            Ok(result) => {
                OwnershipMetrics::record_acquired(result);
                tracing::trace!(session_id = %real_id, result = result.as_str(), "Acquired session ownership");
                Ok(result)
            }
            Err(e) => {
                OwnershipMetrics::record_failure("error");
                Err(SessionError::OwnershipAcquisitionFailed {
                    id: real_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Release ownership; `remove` discards the ownership record entirely
    pub async fn release(&self, real_id: &str, remove: bool) {
        let Some(backend) = &self.backend else {
            return;
        };
        if let Err(e) = backend.relinquish_session_ownership(real_id, remove).await {
            tracing::warn!(
                session_id = %real_id,
                error = %e,
                "Failed to relinquish session ownership"
            );
        }
    }
}
