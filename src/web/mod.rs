//! HTTP API server.

mod handlers;

use crate::config::ServerConfig;
use crate::devices::DeviceService;
use crate::monitor::MonitorCoordinator;
use crate::runtime::RuntimeTimeline;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub devices: Arc<DeviceService>,
    pub coordinator: Arc<MonitorCoordinator>,
    pub timeline: Arc<RuntimeTimeline>,
}

/// Web server for runtrail.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = routes(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Build the router with all routes.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/drivers", get(handlers::handle_get_drivers))
        .route(
            "/api/devices",
            get(handlers::handle_get_devices).post(handlers::handle_create_device),
        )
        .route(
            "/api/devices/{id}",
            put(handlers::handle_update_device).delete(handlers::handle_delete_device),
        )
        .route(
            "/api/devices/{id}/monitor",
            get(handlers::handle_get_monitor)
                .post(handlers::handle_start_monitor)
                .delete(handlers::handle_stop_monitor),
        )
        .route("/api/devices/{id}/utilization", get(handlers::handle_get_utilization))
        .route("/api/devices/{id}/summary", get(handlers::handle_get_summary))
        .route("/api/devices/{id}/stream", get(handlers::handle_snapshot_stream))
        .route("/api/devices/{id}/summary/stream", get(handlers::handle_summary_stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}
