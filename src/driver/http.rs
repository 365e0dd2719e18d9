//! HTTP driver: reads the status from a JSON endpoint exposed by the device
//! or by a gateway in front of it.
//!
//! The endpoint must answer `GET` with `{"status": "running"}` (or `standby`,
//! `alarm`, `offline`).

use super::{DeviceDriver, DriverError, DriverMetadata, SettingDescriptor};
use crate::db::{Category, Device, Snapshot, Status};

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const URL_KEY: &str = "url";
const TIMEOUT_KEY: &str = "timeout_ms";
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: Status,
}

pub struct HttpDriver;

impl HttpDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn timeout_for(device: &Device) -> Result<Duration, DriverError> {
    match device.variable_setting(TIMEOUT_KEY) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| DriverError::Config(format!("{} must be milliseconds, got {:?}", TIMEOUT_KEY, raw))),
        None => Ok(DEFAULT_TIMEOUT),
    }
}

#[async_trait]
impl DeviceDriver for HttpDriver {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            name: "http",
            display_name: "HTTP status endpoint",
            categories: vec![Category::Machine, Category::Magazine, Category::Robot],
            connection_settings: vec![SettingDescriptor {
                key: URL_KEY,
                display_name: "Status URL",
                note: "GET endpoint returning {\"status\": ...}",
                default: "",
            }],
            variable_settings: vec![SettingDescriptor {
                key: TIMEOUT_KEY,
                display_name: "Request timeout",
                note: "milliseconds",
                default: "2000",
            }],
        }
    }

    async fn snapshot(&self, device: &Device) -> Result<Snapshot, DriverError> {
        let address = device
            .connection_setting(URL_KEY)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| DriverError::Config(format!("missing connection setting {:?}", URL_KEY)))?;
        let url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        let timeout = timeout_for(device)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DriverError::Network(e.to_string()))?;

        let response = client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                DriverError::Timeout(timeout)
            } else {
                DriverError::Network(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(DriverError::Protocol(format!("{} returned {}", url, response.status())));
        }

        let body: StatusBody = response
            .json()
            .await
            .map_err(|e| DriverError::Protocol(format!("invalid status body: {}", e)))?;

        Ok(Snapshot::now(device.id, body.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Setting;
    use axum::{routing::get, Json, Router};

    fn device(url: &str) -> Device {
        Device {
            id: 3,
            driver: "http".to_string(),
            connection_settings: vec![Setting {
                key: URL_KEY.to_string(),
                value: url.to_string(),
            }],
            variable_settings: vec![Setting {
                key: TIMEOUT_KEY.to_string(),
                value: "500".to_string(),
            }],
            ..Default::default()
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("{}/status", addr)
    }

    #[tokio::test]
    async fn test_reads_status_from_endpoint() {
        let router = Router::new().route("/status", get(|| async { Json(serde_json::json!({"status": "alarm"})) }));
        let url = serve(router).await;

        let snapshot = HttpDriver::new().snapshot(&device(&url)).await.unwrap();
        assert_eq!(snapshot.device_id, 3);
        assert_eq!(snapshot.status, Status::Alarm);
    }

    #[tokio::test]
    async fn test_bad_body_is_protocol_error() {
        let router = Router::new().route("/status", get(|| async { "not json" }));
        let url = serve(router).await;

        let result = HttpDriver::new().snapshot(&device(&url)).await;
        assert!(matches!(result, Err(DriverError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_missing_url_is_config_error() {
        let result = HttpDriver::new().snapshot(&Device::default()).await;
        assert!(matches!(result, Err(DriverError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_device() {
        let result = HttpDriver::new().snapshot(&device("http://256.256.256.256")).await;
        assert!(result.is_err());
    }
}
