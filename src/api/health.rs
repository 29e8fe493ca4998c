//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::manager::ManagerStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub node_id: String,
    pub accepting_requests: bool,
    pub cache: CacheHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct CacheHealthResponse {
    pub backend: String,
    pub connected: bool,
    pub cluster_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub sessions: ManagerStats,
    pub replication: ReplicationStats,
}

#[derive(Debug, Serialize)]
pub struct ReplicationStats {
    pub granularity: String,
    pub snapshot_mode: String,
    pub passivation_enabled: bool,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let manager = &state.manager;
    let connected = match &state.redis {
        Some(redis) => match redis.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Redis health check failed");
                false
            }
        },
        None => true,
    };

    let accepting_requests = manager.gate().is_open();
    let status = if connected && accepting_requests {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        node_id: manager.node_id().to_string(),
        accepting_requests,
        cache: CacheHealthResponse {
            backend: manager.cache().backend_type().as_str().to_string(),
            connected,
            cluster_enabled: state.settings.cluster.enabled,
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let config = state.manager.config();
    Json(StatsResponse {
        sessions: state.manager.stats(),
        replication: ReplicationStats {
            granularity: format!("{:?}", config.replication.granularity).to_lowercase(),
            snapshot_mode: format!("{:?}", config.replication.snapshot_mode).to_lowercase(),
            passivation_enabled: config.passivation.enabled,
        },
    })
}
