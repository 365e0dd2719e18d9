//! Demo driver producing random statuses, for trying the system without hardware.

use super::{DeviceDriver, DriverError, DriverMetadata, SettingDescriptor};
use crate::db::{Category, Device, Snapshot, Status};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

const CHANGE_INTERVAL_KEY: &str = "snapshot_change_interval";
const DEFAULT_CHANGE_INTERVAL_SECS: i64 = 60;

/// Picks a random status per device and keeps it for a configurable period.
pub struct DemoDriver {
    current: Mutex<HashMap<i64, (Status, DateTime<Utc>)>>,
}

impl DemoDriver {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for DemoDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn change_interval(device: &Device) -> i64 {
    let Some(raw) = device.variable_setting(CHANGE_INTERVAL_KEY) else {
        return DEFAULT_CHANGE_INTERVAL_SECS;
    };
    match raw.trim().parse::<i64>() {
        Ok(secs) => secs,
        Err(_) => {
            tracing::warn!(
                device_id = device.id,
                "Invalid {} {:?}, using {}s",
                CHANGE_INTERVAL_KEY,
                raw,
                DEFAULT_CHANGE_INTERVAL_SECS
            );
            DEFAULT_CHANGE_INTERVAL_SECS
        }
    }
}

fn random_status() -> Status {
    Status::ALL[rand::random::<usize>() % Status::ALL.len()]
}

#[async_trait]
impl DeviceDriver for DemoDriver {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            name: "demo",
            display_name: "Demo driver",
            categories: vec![Category::Machine, Category::Magazine, Category::Robot],
            connection_settings: Vec::new(),
            variable_settings: vec![SettingDescriptor {
                key: CHANGE_INTERVAL_KEY,
                display_name: "Snapshot change interval",
                note: "seconds",
                default: "60",
            }],
        }
    }

    async fn snapshot(&self, device: &Device) -> Result<Snapshot, DriverError> {
        let interval = change_interval(device);

        let now = Utc::now();
        let mut current = self
            .current
            .lock()
            .map_err(|_| DriverError::Protocol("demo driver state poisoned".to_string()))?;

        let entry = current.entry(device.id).or_insert_with(|| (random_status(), now));
        if (now - entry.1).num_seconds() >= interval {
            *entry = (random_status(), now);
        }

        Ok(Snapshot {
            device_id: device.id,
            status: entry.0,
            timestamp: now,
        })
    }
}
