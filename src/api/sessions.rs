//! Session administration endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::manager::{MaintenanceReport, ManagerStats, UnloadedSessionEntry};
use crate::server::AppState;
use crate::session::SessionInfo;

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub local_ids: Vec<String>,
    pub stats: ManagerStats,
}

#[derive(Debug, Serialize)]
pub struct SessionLocationResponse {
    pub id: String,
    pub real_id: String,
    /// Held in this node's memory
    pub local: bool,
    /// Present in the distributed cache as seen from this node
    pub in_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unloaded: Option<UnloadedSessionEntry>,
}

/// GET /api/v1/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        local_ids: state.manager.local_session_ids(),
        stats: state.manager.stats(),
    })
}

/// GET /api/v1/sessions/{id} - locate a session without loading it
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionLocationResponse>> {
    let manager = &state.manager;
    let real_id = manager.real_id(&id);

    let session = match manager.local_session(&real_id) {
        Some(session) => Some(session.info().await),
        None => None,
    };
    let unloaded = manager.unloaded_entry(&real_id);
    let cache = manager.cache();
    let in_cache = cache.is_local(&real_id).await;
    let owner = cache.locate(&real_id).await;

    if session.is_none() && unloaded.is_none() && !in_cache {
        return Err(AppError::NotFound(format!("session {}", real_id)));
    }

    Ok(Json(SessionLocationResponse {
        id,
        real_id,
        local: session.is_some(),
        in_cache,
        owner,
        session,
        unloaded,
    }))
}

/// POST /api/v1/maintenance - run one maintenance pass now
pub async fn run_maintenance(State(state): State<AppState>) -> Result<Json<MaintenanceReport>> {
    if !state.manager.is_started() {
        return Err(AppError::Unavailable("session manager is not running".to_string()));
    }
    Ok(Json(state.manager.tick().await))
}
