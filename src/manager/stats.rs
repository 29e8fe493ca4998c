use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Lifetime counters of a session manager
#[derive(Debug, Default)]
pub(crate) struct ManagerCounters {
    pub created: AtomicU64,
    pub expired: AtomicU64,
    pub rejected: AtomicU64,
    pub activated: AtomicU64,
    pub passivated: AtomicUsize,
    pub max_passivated: AtomicUsize,
}

impl ManagerCounters {
    pub fn session_passivated(&self) -> usize {
        let current = self.passivated.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_passivated.fetch_max(current, Ordering::AcqRel);
        current
    }

    /// Never drops below zero
    pub fn session_activated(&self) {
        let _ = self
            .passivated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.activated.fetch_add(1, Ordering::Relaxed);
    }

    /// A passivated session left this node without being activated here
    pub fn passivation_released(&self) {
        let _ = self
            .passivated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn passivated(&self) -> usize {
        self.passivated.load(Ordering::Acquire)
    }
}

/// Point-in-time view of a session manager
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub node_id: String,
    pub hot_sessions: usize,
    pub unloaded_sessions: usize,
    pub passivated_sessions: usize,
    pub max_passivated_sessions: usize,
    pub active_sessions: usize,
    pub max_active_allowed: Option<usize>,
    pub sessions_created: u64,
    pub sessions_expired: u64,
    pub sessions_rejected: u64,
    pub sessions_activated: u64,
    pub requests_in_flight: usize,
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub purged: usize,
    pub passivated: usize,
    pub failures: usize,
    pub forced_cleanups: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Outcome of stopping a session manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub passivated: usize,
    pub expired: usize,
    pub unloaded_released: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passivation_counters() {
        let counters = ManagerCounters::default();
        counters.session_passivated();
        counters.session_passivated();
        counters.session_activated();

        assert_eq!(counters.passivated(), 1);
        assert_eq!(counters.max_passivated.load(Ordering::Relaxed), 2);

        counters.session_activated();
        counters.session_activated();
        assert_eq!(counters.passivated(), 0);
        assert_eq!(counters.activated.load(Ordering::Relaxed), 3);

        counters.session_passivated();
        counters.passivation_released();
        assert_eq!(counters.passivated(), 0);
        assert_eq!(counters.activated.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_empty_report() {
        assert!(MaintenanceReport::default().is_empty());
        let report = MaintenanceReport {
            expired: 1,
            ..Default::default()
        };
        assert!(!report.is_empty());
    }
}
