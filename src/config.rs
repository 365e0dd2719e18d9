//! Configuration module for runtrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "runtrail.db")
    pub db_path: String,
    /// Poll period of every device loop (default: 1s)
    pub poll_interval: Duration,
    /// Days of closed runtime history to keep; 0 keeps everything (default: 365)
    pub retention_days: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "runtrail.db".to_string(),
            poll_interval: Duration::from_millis(1000),
            retention_days: 365,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RUNTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `RUNTRAIL_DB_PATH`: Database file path (default: "runtrail.db")
    /// - `RUNTRAIL_POLL_INTERVAL_MS`: Poll period in milliseconds (default: 1000)
    /// - `RUNTRAIL_RETENTION_DAYS`: History retention in days (default: 365)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(port) = lookup("RUNTRAIL_HTTP_PORT").and_then(|s| s.parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("RUNTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(ms) = lookup("RUNTRAIL_POLL_INTERVAL_MS").and_then(|s| s.parse::<u64>().ok()) {
            if ms > 0 {
                cfg.poll_interval = Duration::from_millis(ms);
            } else {
                tracing::warn!("Ignoring RUNTRAIL_POLL_INTERVAL_MS=0");
            }
        }

        if let Some(days) = lookup("RUNTRAIL_RETENTION_DAYS").and_then(|s| s.parse().ok()) {
            cfg.retention_days = days;
        }

        cfg
    }
}
