use serde::Serialize;

/// A session known to exist in the distributed cache but not held in local memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnloadedSessionEntry {
    /// Node believed to own the session; `None` when passivated from this node
    pub owner: Option<String>,
    pub last_update_time: i64,
    pub max_inactive_seconds: i64,
    /// Evicted from this node's memory by passivation
    pub passivated: bool,
}

impl UnloadedSessionEntry {
    pub fn new(owner: Option<String>, last_update_time: i64, max_inactive_seconds: i64) -> Self {
        Self {
            owner,
            last_update_time,
            max_inactive_seconds,
            passivated: false,
        }
    }

    pub fn passivated(last_update_time: i64, max_inactive_seconds: i64) -> Self {
        Self {
            owner: None,
            last_update_time,
            max_inactive_seconds,
            passivated: true,
        }
    }

    /// Whether the session has been idle past its timeout plus a grace period
    pub fn is_presumed_expired(&self, now: i64, grace_ms: i64) -> bool {
        self.max_inactive_seconds >= 1
            && now - self.last_update_time >= self.max_inactive_seconds * 1000 + grace_ms
    }
}
