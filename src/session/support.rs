use std::sync::Arc;

use crate::cache::DistributedCache;
use crate::clock::Clock;
use crate::config::ReplicationConfig;
use crate::ownership::OwnershipCoordinator;

use super::notification::{NotificationPolicy, SessionEvent, SessionListener};

/// Collaborators shared by every session record of one manager
pub struct SessionSupport {
    pub cache: Arc<dyn DistributedCache>,
    pub ownership: OwnershipCoordinator,
    pub clock: Arc<dyn Clock>,
    pub replication: ReplicationConfig,
    pub policy: NotificationPolicy,
    pub listeners: Vec<Arc<dyn SessionListener>>,
    pub jvm_route: Option<String>,
    pub default_max_inactive_seconds: i64,
}

impl SessionSupport {
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Deliver an event to every listener if the policy allows it
    pub fn notify(&self, event: SessionEvent, local: bool) {
        if self.listeners.is_empty() || !self.policy.allows(&event, local) {
            return;
        }
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }
}
