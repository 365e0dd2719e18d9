//! runtrail - device runtime monitoring service
//!
//! Polls industrial devices through pluggable drivers and keeps a persistent
//! timeline of how long each one spent running, idle, in alarm or offline.

mod config;
mod db;
mod devices;
mod driver;
mod hub;
mod monitor;
mod runtime;
mod web;

use config::ServerConfig;
use db::Store;
use devices::DeviceService;
use driver::DriverRegistry;
use monitor::{MonitorCoordinator, RetentionManager};
use runtime::RuntimeTimeline;
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("runtrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting runtrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let registry = Arc::new(DriverRegistry::builtin());
    let timeline = Arc::new(RuntimeTimeline::new(store.clone()));
    let devices = Arc::new(DeviceService::new(store.clone(), registry.clone()));
    let coordinator = Arc::new(MonitorCoordinator::new(
        store.clone(),
        store.clone(),
        registry,
        timeline.clone(),
        cfg.poll_interval,
    ));

    // Add a demo device on first start
    if devices.list()?.is_empty() {
        tracing::info!("Adding sample device: Demo machine");
        let device = devices.add(db::Device {
            name: "Demo machine".to_string(),
            ..Default::default()
        })?;
        coordinator.start_monitor(device.id).await?;
    }

    // Resume monitors and follow device changes
    coordinator.spawn_device_listener(devices.subscribe());
    coordinator.resume().await?;

    let retention = RetentionManager::new(store, cfg.retention_days);
    retention.start();

    // Start web server
    let server = Server::new(
        cfg,
        AppState {
            devices,
            coordinator,
            timeline,
        },
    );
    server.start().await?;

    retention.stop().await;
    tracing::info!("runtrail stopped");

    Ok(())
}
