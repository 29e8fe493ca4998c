//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::cache::LockResult;
use crate::manager::MaintenanceReport;

use super::{
    CLUSTER_EVENTS_LAGGED, CLUSTER_EVENTS_RECEIVED, MAINTENANCE_CLEANUP_FAILURES,
    MAINTENANCE_DURATION, MAINTENANCE_FORCED_CLEANUPS, MAINTENANCE_SESSIONS_TOTAL,
    OWNERSHIP_ACQUIRED_TOTAL, OWNERSHIP_FAILURES_TOTAL, REPLICATION_FAILURES_TOTAL,
    REPLICATION_LATENCY, REPLICATION_WRITES_TOTAL, SESSIONS_HOT, SESSIONS_PASSIVATED,
    SESSIONS_UNLOADED, SESSION_LIFECYCLE_TOTAL, SESSION_LOAD_LATENCY,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for session lifecycle metrics
pub struct SessionMetrics;

impl SessionMetrics {
    pub fn set_counts(hot: usize, unloaded: usize, passivated: usize) {
        SESSIONS_HOT.set(hot as i64);
        SESSIONS_UNLOADED.set(unloaded as i64);
        SESSIONS_PASSIVATED.set(passivated as i64);
    }

    pub fn record_created() {
        SESSION_LIFECYCLE_TOTAL.with_label_values(&["created"]).inc();
    }

    pub fn record_expired() {
        SESSION_LIFECYCLE_TOTAL.with_label_values(&["expired"]).inc();
    }

    /// Record a creation refused at the capacity limit
    pub fn record_rejected() {
        SESSION_LIFECYCLE_TOTAL.with_label_values(&["rejected"]).inc();
    }

    pub fn record_passivated() {
        SESSION_LIFECYCLE_TOTAL.with_label_values(&["passivated"]).inc();
    }

    pub fn record_activated() {
        SESSION_LIFECYCLE_TOTAL.with_label_values(&["activated"]).inc();
    }

    pub fn record_load(latency_secs: f64) {
        SESSION_LOAD_LATENCY.observe(latency_secs);
    }
}

/// Helper struct for replication metrics
pub struct ReplicationMetrics;

impl ReplicationMetrics {
    pub fn record_success(latency_secs: f64) {
        REPLICATION_WRITES_TOTAL.inc();
        REPLICATION_LATENCY.observe(latency_secs);
    }

    pub fn record_failure() {
        REPLICATION_FAILURES_TOTAL.inc();
    }
}

/// Helper struct for ownership metrics
pub struct OwnershipMetrics;

impl OwnershipMetrics {
    pub fn record_acquired(result: LockResult) {
        OWNERSHIP_ACQUIRED_TOTAL
            .with_label_values(&[result.as_str()])
            .inc();
    }

    /// Record a failed acquisition ("timeout" or "error")
    pub fn record_failure(reason: &str) {
        OWNERSHIP_FAILURES_TOTAL.with_label_values(&[reason]).inc();
    }
}

/// Helper struct for maintenance metrics
pub struct MaintenanceMetrics;

impl MaintenanceMetrics {
    pub fn record_pass(duration_secs: f64, report: &MaintenanceReport) {
        MAINTENANCE_DURATION.observe(duration_secs);
        for (action, count) in [
            ("expired", report.expired),
            ("purged", report.purged),
            ("passivated", report.passivated),
        ] {
            if count > 0 {
                MAINTENANCE_SESSIONS_TOTAL
                    .with_label_values(&[action])
                    .inc_by(count as u64);
            }
        }
    }

    pub fn record_cleanup_failure() {
        MAINTENANCE_CLEANUP_FAILURES.inc();
    }

    pub fn record_forced_cleanup() {
        MAINTENANCE_FORCED_CLEANUPS.inc();
    }
}

/// Helper struct for cluster event metrics
pub struct ClusterEventMetrics;

impl ClusterEventMetrics {
    /// Record an event from another node ("changed" or "removed")
    pub fn record_received(event_type: &str) {
        CLUSTER_EVENTS_RECEIVED.with_label_values(&[event_type]).inc();
    }

    pub fn record_lagged(skipped: u64) {
        CLUSTER_EVENTS_LAGGED.inc_by(skipped);
    }
}
