//! HTTP request handlers.

use super::AppState;
use crate::db::{Category, DbError, Device, EnrichedSnapshot, RuntimeSummary};
use crate::devices::DeviceError;
use crate::hub::Subscription;
use crate::monitor::StopReason;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};

// ============================================================================
// Helpers
// ============================================================================

fn device_error_response(e: DeviceError) -> Response {
    match e {
        DeviceError::UnknownDriver(_) | DeviceError::UnsupportedCategory { .. } => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        DeviceError::Store(DbError::NotFound) => (StatusCode::NOT_FOUND, "Device not found").into_response(),
        DeviceError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

/// `Ok(())` if the device exists, otherwise the response to return.
fn require_device(state: &AppState, id: i64) -> Result<(), Response> {
    match state.devices.get(id) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err((StatusCode::NOT_FOUND, "Device not found").into_response()),
        Err(e) => Err(device_error_response(e)),
    }
}

fn parse_time(name: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, Response> {
    match raw {
        None | Some("") => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| (StatusCode::BAD_REQUEST, format!("{} must be RFC 3339", name)).into_response()),
    }
}

// ============================================================================
// API: Drivers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DriversQuery {
    #[serde(default)]
    pub category: Option<Category>,
}

pub async fn handle_get_drivers(
    State(state): State<AppState>,
    Query(query): Query<DriversQuery>,
) -> impl IntoResponse {
    let registry = state.devices.registry();
    match query.category {
        Some(category) => Json(registry.drivers_for(category)),
        None => Json(registry.metadata()),
    }
}

// ============================================================================
// API: Devices
// ============================================================================

pub async fn handle_get_devices(State(state): State<AppState>) -> impl IntoResponse {
    match state.devices.list() {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => device_error_response(e),
    }
}

pub async fn handle_create_device(State(state): State<AppState>, Json(device): Json<Device>) -> impl IntoResponse {
    match state.devices.add(Device { id: 0, ..device }) {
        Ok(device) => (StatusCode::CREATED, Json(device)).into_response(),
        Err(e) => device_error_response(e),
    }
}

pub async fn handle_update_device(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(device): Json<Device>,
) -> impl IntoResponse {
    match state.devices.update(Device { id, ..device }) {
        Ok(device) => Json(device).into_response(),
        Err(e) => device_error_response(e),
    }
}

pub async fn handle_delete_device(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    if let Err(response) = require_device(&state, id) {
        return response;
    }

    if let Err(e) = state.coordinator.stop_monitor(id, StopReason::Removed).await {
        tracing::warn!(device_id = id, "Failed to stop monitor before delete: {}", e);
    }

    match state.devices.delete(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => device_error_response(e),
    }
}

// ============================================================================
// API: Monitoring
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MonitorState {
    pub monitoring: bool,
}

pub async fn handle_get_monitor(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.coordinator.is_monitoring(id) {
        Ok(monitoring) => Json(MonitorState { monitoring }).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn handle_start_monitor(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    if let Err(response) = require_device(&state, id) {
        return response;
    }
    match state.coordinator.start_monitor(id).await {
        Ok(()) => Json(MonitorState { monitoring: true }).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn handle_stop_monitor(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    if let Err(response) = require_device(&state, id) {
        return response;
    }
    match state.coordinator.stop_monitor(id, StopReason::Temporary).await {
        Ok(()) => Json(MonitorState { monitoring: false }).into_response(),
        Err(e) => internal_error(e),
    }
}

// ============================================================================
// API: Runtime queries
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

impl RangeQuery {
    fn bounds(&self) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), Response> {
        Ok((
            parse_time("from", self.from.as_deref())?,
            parse_time("to", self.to.as_deref())?,
        ))
    }
}

#[derive(Debug, Serialize)]
pub struct UtilizationResponse {
    pub utilization: f64,
}

pub async fn handle_get_utilization(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    let (from, to) = match query.bounds() {
        Ok(bounds) => bounds,
        Err(response) => return response,
    };
    match state.timeline.get_utilization(id, from, to) {
        Ok(utilization) => Json(UtilizationResponse { utilization }).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn handle_get_summary(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    let (from, to) = match query.bounds() {
        Ok(bounds) => bounds,
        Err(response) => return response,
    };
    match state.timeline.get_summary(id, from, to) {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => internal_error(e),
    }
}

// ============================================================================
// API: Live streams
// ============================================================================

/// Bridge a hub subscription into an SSE stream. The returned stream owns the
/// subscription, so a client disconnect releases the handler.
fn subscription_stream<T, S>(subscribe: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    T: Serialize + 'static,
    S: FnOnce(Box<dyn Fn(&T) + Send + Sync>) -> Subscription,
{
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let subscription = subscribe(Box::new(move |payload: &T| match serde_json::to_string(payload) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => tracing::warn!("Failed to encode stream event: {}", e),
    }));

    let stream = UnboundedReceiverStream::new(rx).map(move |json| {
        let _held = &subscription;
        Ok::<_, Infallible>(Event::default().data(json))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn handle_snapshot_stream(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    if let Err(response) = require_device(&state, id) {
        return response;
    }
    subscription_stream::<EnrichedSnapshot, _>(move |handler| state.coordinator.subscribe(id, handler)).into_response()
}

pub async fn handle_summary_stream(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    if let Err(response) = require_device(&state, id) {
        return response;
    }
    subscription_stream::<RuntimeSummary, _>(move |handler| state.timeline.subscribe_summary(id, handler)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::devices::DeviceService;
    use crate::driver::DriverRegistry;
    use crate::monitor::MonitorCoordinator;
    use crate::runtime::RuntimeTimeline;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    async fn serve() -> String {
        let store = Arc::new(Store::new(":memory:").unwrap());
        let registry = Arc::new(DriverRegistry::builtin());
        let timeline = Arc::new(RuntimeTimeline::new(store.clone()));
        let coordinator = Arc::new(MonitorCoordinator::new(
            store.clone(),
            store.clone(),
            registry.clone(),
            timeline.clone(),
            Duration::from_millis(20),
        ));
        let state = AppState {
            devices: Arc::new(DeviceService::new(store, registry)),
            coordinator,
            timeline,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, crate::web::routes(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_device_lifecycle_over_http() {
        let base = serve().await;
        let client = reqwest::Client::new();

        let drivers: Value = client.get(format!("{}/api/drivers?category=robot", base)).send().await.unwrap().json().await.unwrap();
        assert!(drivers.as_array().unwrap().iter().any(|d| d["name"] == "demo"));

        let response = client
            .post(format!("{}/api/devices", base))
            .json(&json!({"name": "Cell 2", "category": "robot", "driver": "demo"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let device: Device = response.json().await.unwrap();

        let monitor = format!("{}/api/devices/{}/monitor", base, device.id);
        let state: Value = client.post(&monitor).send().await.unwrap().json().await.unwrap();
        assert_eq!(state, json!({"monitoring": true}));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state: Value = client.delete(&monitor).send().await.unwrap().json().await.unwrap();
        assert_eq!(state, json!({"monitoring": false}));
        let state: Value = client.get(&monitor).send().await.unwrap().json().await.unwrap();
        assert_eq!(state, json!({"monitoring": false}));

        let summary: RuntimeSummary = client
            .get(format!("{}/api/devices/{}/summary", base, device.id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!summary.intervals.is_empty());

        let response = client.delete(format!("{}/api/devices/{}", base, device.id)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
        let devices: Vec<Device> = client.get(format!("{}/api/devices", base)).send().await.unwrap().json().await.unwrap();
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let base = serve().await;
        let client = reqwest::Client::new();

        let response = client.post(format!("{}/api/devices/42/monitor", base)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let response = client
            .post(format!("{}/api/devices", base))
            .json(&json!({"name": "Lathe", "category": "machine", "driver": "focas"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let response = client
            .get(format!("{}/api/devices/1/utilization?from=yesterday", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let utilization: Value = client
            .get(format!("{}/api/devices/1/utilization", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(utilization, json!({"utilization": 0.0}));
    }
}
