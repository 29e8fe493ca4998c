//! Prometheus metrics for the session cluster node.
//!
//! - Session metrics (hot, unloaded and passivated counts; lifecycle counters)
//! - Replication metrics (writes, failures, latency)
//! - Ownership metrics (acquisitions by outcome, failures)
//! - Maintenance metrics (pass duration, cleanup failures)
//! - Cluster event metrics

mod helpers;

pub use helpers::{
    encode_metrics, ClusterEventMetrics, MaintenanceMetrics, OwnershipMetrics, ReplicationMetrics,
    SessionMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_session";

lazy_static! {
    // ============================================================================
    // Session Metrics
    // ============================================================================

    /// Sessions held in local memory
    pub static ref SESSIONS_HOT: IntGauge = register_int_gauge!(
        format!("{}_hot", METRIC_PREFIX),
        "Number of sessions held in local memory"
    ).unwrap();

    /// Sessions known to the cluster but not held locally
    pub static ref SESSIONS_UNLOADED: IntGauge = register_int_gauge!(
        format!("{}_unloaded", METRIC_PREFIX),
        "Number of sessions indexed but not loaded"
    ).unwrap();

    /// Sessions passivated from this node
    pub static ref SESSIONS_PASSIVATED: IntGauge = register_int_gauge!(
        format!("{}_passivated", METRIC_PREFIX),
        "Number of sessions currently passivated"
    ).unwrap();

    /// Session lifecycle transitions by kind
    pub static ref SESSION_LIFECYCLE_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_lifecycle_total", METRIC_PREFIX),
        "Session lifecycle transitions",
        &["event"]
    ).unwrap();

    /// Time to load a session from the distributed cache
    pub static ref SESSION_LOAD_LATENCY: Histogram = register_histogram!(
        format!("{}_load_latency_seconds", METRIC_PREFIX),
        "Latency of loading a session from the distributed cache",
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    ).unwrap();

    // ============================================================================
    // Replication Metrics
    // ============================================================================

    /// Successful replication writes
    pub static ref REPLICATION_WRITES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_replication_writes_total", METRIC_PREFIX),
        "Total session writes to the distributed cache"
    ).unwrap();

    /// Failed replication writes
    pub static ref REPLICATION_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_replication_failures_total", METRIC_PREFIX),
        "Total failed session writes"
    ).unwrap();

    pub static ref REPLICATION_LATENCY: Histogram = register_histogram!(
        format!("{}_replication_latency_seconds", METRIC_PREFIX),
        "Latency of session writes to the distributed cache",
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    ).unwrap();

    // ============================================================================
    // Ownership Metrics
    // ============================================================================

    /// Ownership acquisitions by result
    pub static ref OWNERSHIP_ACQUIRED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ownership_acquired_total", METRIC_PREFIX),
        "Session ownership acquisitions",
        &["result"]
    ).unwrap();

    /// Ownership failures by reason
    pub static ref OWNERSHIP_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ownership_failures_total", METRIC_PREFIX),
        "Session ownership acquisition failures",
        &["reason"]
    ).unwrap();

    // ============================================================================
    // Maintenance Metrics
    // ============================================================================

    pub static ref MAINTENANCE_DURATION: Histogram = register_histogram!(
        format!("{}_maintenance_duration_seconds", METRIC_PREFIX),
        "Duration of maintenance passes",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    /// Sessions handled by maintenance, by action
    pub static ref MAINTENANCE_SESSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_maintenance_sessions_total", METRIC_PREFIX),
        "Sessions expired, purged or passivated by maintenance",
        &["action"]
    ).unwrap();

    pub static ref MAINTENANCE_CLEANUP_FAILURES: IntCounter = register_int_counter!(
        format!("{}_maintenance_cleanup_failures_total", METRIC_PREFIX),
        "Failed attempts to clean up expired sessions"
    ).unwrap();

    pub static ref MAINTENANCE_FORCED_CLEANUPS: IntCounter = register_int_counter!(
        format!("{}_maintenance_forced_cleanups_total", METRIC_PREFIX),
        "Sessions removed locally after repeated cleanup failures"
    ).unwrap();

    // ============================================================================
    // Cluster Metrics
    // ============================================================================

    /// Cluster events received from other nodes
    pub static ref CLUSTER_EVENTS_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_cluster_events_received_total", METRIC_PREFIX),
        "Cluster events received from other nodes",
        &["type"]
    ).unwrap();

    /// Cluster event subscription lag (events dropped)
    pub static ref CLUSTER_EVENTS_LAGGED: IntCounter = register_int_counter!(
        format!("{}_cluster_events_lagged_total", METRIC_PREFIX),
        "Cluster events dropped because the subscriber lagged"
    ).unwrap();
}
