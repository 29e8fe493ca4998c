use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::health::{health, stats};
use super::metrics::prometheus_metrics;
use super::sessions::{get_session, list_sessions, run_maintenance};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Session administration
        .nest(
            "/api/v1",
            Router::new()
                .route("/sessions", get(list_sessions))
                .route("/sessions/{id}", get(get_session))
                .route("/maintenance", post(run_maintenance)),
        )
}
