use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ara_session_cluster::cache::{create_distributed_cache, RedisEventRelay};
use ara_session_cluster::config::Settings;
use ara_session_cluster::manager::{ManagerConfig, SessionManager};
use ara_session_cluster::server::{create_app, AppState};
use ara_session_cluster::shutdown::GracefulShutdown;
use ara_session_cluster::tasks::{ClusterEventSubscriber, MaintenanceTask};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!(node_id = %settings.cluster.node_id, "Configuration loaded");

    // Create the distributed cache and the session manager on top of it
    let handle = create_distributed_cache(&settings.cluster, &settings.redis).await;
    let manager = Arc::new(SessionManager::new(
        ManagerConfig::from_settings(&settings),
        handle.cache.clone(),
    ));
    manager.start().await;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut background = Vec::new();

    // Relay Redis pub/sub into the cache's event channel
    if let Some(redis) = &handle.redis {
        let relay = RedisEventRelay::new(
            &settings.redis,
            redis.event_channel(),
            redis.event_sender(),
            shutdown_tx.subscribe(),
        );
        background.push(tokio::spawn(relay.run()));
    }

    // Feed cluster events into the manager
    if let Some(subscriber) =
        ClusterEventSubscriber::for_manager(manager.clone(), shutdown_tx.subscribe())
    {
        background.push(tokio::spawn(subscriber.run()));
    }

    // Periodic maintenance
    let maintenance = MaintenanceTask::new(
        manager.clone(),
        Duration::from_secs(settings.session.maintenance_interval_seconds.max(1)),
        shutdown_tx.subscribe(),
    );
    background.push(tokio::spawn(maintenance.run()));

    // Create Axum app
    let addr = settings.server_addr();
    let state = AppState::new(settings, manager.clone(), handle.redis.clone());
    let app = create_app(state);

    // Start server
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Admin server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Release sessions and stop background tasks
    let result = GracefulShutdown::new(manager, shutdown_tx)
        .execute("server shutdown")
        .await;
    if !result.success {
        tracing::warn!("Session manager did not stop cleanly");
    }

    tracing::info!("Waiting for background tasks to finish...");
    futures::future::join_all(background).await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
