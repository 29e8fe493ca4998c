//! Admin HTTP surface, driven through the router without binding a socket

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use ara_session_cluster::cache::MemoryDistributedCache;
use ara_session_cluster::config::Settings;
use ara_session_cluster::manager::{ManagerConfig, SessionManager};
use ara_session_cluster::server::{create_app, AppState};

async fn setup() -> (Router, Arc<SessionManager>) {
    let cache = Arc::new(MemoryDistributedCache::standalone("node-a"));
    let manager = Arc::new(SessionManager::new(ManagerConfig::default(), cache));
    manager.start().await;
    let app = create_app(AppState::new(Settings::default(), manager.clone(), None));
    (app, manager)
}

async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_health_reports_node() {
    let (app, _) = setup().await;
    let (status, body) = call(app, Method::GET, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["node_id"], "node-a");
    assert_eq!(body["accepting_requests"], true);
}

#[tokio::test]
async fn test_get_session_locates_local_copy() {
    let (app, manager) = setup().await;
    let session = manager.create(Some("abc")).await.unwrap();
    session.set_attribute("user", json!("alice")).await.unwrap();
    manager.store(&session).await;

    let (status, body) = call(app, Method::GET, "/api/v1/sessions/abc").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["real_id"], "abc");
    assert_eq!(body["local"], true);
    assert_eq!(body["in_cache"], true);
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let (app, _) = setup().await;
    let (status, body) = call(app, Method::GET, "/api/v1/sessions/missing").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_maintenance_after_stop_is_unavailable() {
    let (app, manager) = setup().await;
    let (status, _) = call(app.clone(), Method::POST, "/api/v1/maintenance").await;
    assert_eq!(status, StatusCode::OK);

    manager.stop().await;
    let (status, body) = call(app, Method::POST, "/api/v1/maintenance").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "UNAVAILABLE");
}

#[tokio::test]
async fn test_list_sessions_includes_stats() {
    let (app, manager) = setup().await;
    manager.create(Some("one")).await.unwrap();

    let (status, body) = call(app, Method::GET, "/api/v1/sessions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["local_ids"], json!(["one"]));
    assert_eq!(body["stats"]["hot_sessions"], 1);
}
