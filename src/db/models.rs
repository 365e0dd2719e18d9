//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run status reported by a device driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Offline,
    Standby,
    Running,
    Alarm,
}

impl Status {
    pub const ALL: [Status; 4] = [Status::Offline, Status::Standby, Status::Running, Status::Alarm];

    /// Integer code used in the `runtime_intervals.status` column.
    pub fn code(self) -> i64 {
        match self {
            Status::Offline => 0,
            Status::Standby => 1,
            Status::Running => 2,
            Status::Alarm => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Status::Offline),
            1 => Some(Status::Standby),
            2 => Some(Status::Running),
            3 => Some(Status::Alarm),
            _ => None,
        }
    }
}

/// Device category. Drivers declare which categories they can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Machine,
    Magazine,
    Robot,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Machine => "machine",
            Category::Magazine => "magazine",
            Category::Robot => "robot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "machine" => Some(Category::Machine),
            "magazine" => Some(Category::Magazine),
            "robot" => Some(Category::Robot),
            _ => None,
        }
    }
}

/// A single key/value driver setting attached to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

/// A monitored device and the driver configuration used to poll it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub category: Category,
    pub driver: String,
    #[serde(default)]
    pub connection_settings: Vec<Setting>,
    #[serde(default)]
    pub variable_settings: Vec<Setting>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            category: Category::Machine,
            driver: "demo".to_string(),
            connection_settings: Vec::new(),
            variable_settings: Vec::new(),
        }
    }
}

impl Device {
    pub fn connection_setting(&self, key: &str) -> Option<&str> {
        self.connection_settings
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value.as_str())
    }

    pub fn variable_setting(&self, key: &str) -> Option<&str> {
        self.variable_settings
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value.as_str())
    }
}

/// One point-in-time observation of a device's status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub device_id: i64,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    pub fn now(device_id: i64, status: Status) -> Self {
        Self {
            device_id,
            status,
            timestamp: Utc::now(),
        }
    }
}

/// A snapshot together with the device's utilization at that moment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnrichedSnapshot {
    pub device_id: i64,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
    pub utilization: f64,
}

impl EnrichedSnapshot {
    pub fn new(snapshot: Snapshot, utilization: f64) -> Self {
        Self {
            device_id: snapshot.device_id,
            status: snapshot.status,
            timestamp: snapshot.timestamp,
            utilization,
        }
    }
}

/// A maximal contiguous span during which a device held one status.
///
/// `end_time` is `None` only for the most recently opened interval, until the
/// next observation extends or closes it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInterval {
    pub device_id: i64,
    pub status: Status,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RuntimeInterval {
    pub fn open(device_id: i64, status: Status, start_time: DateTime<Utc>) -> Self {
        Self {
            device_id,
            status,
            start_time,
            end_time: None,
        }
    }

    pub fn closed(
        device_id: i64,
        status: Status,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            status,
            start_time,
            end_time: Some(end_time),
        }
    }

    /// Duration of a closed interval; zero while still open.
    pub fn duration(&self) -> chrono::Duration {
        match self.end_time {
            Some(end) => end - self.start_time,
            None => chrono::Duration::zero(),
        }
    }
}

/// Normalized runtime breakdown of one device over a query window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSummary {
    pub intervals: Vec<RuntimeInterval>,
    pub offline_utilization: f64,
    pub standby_utilization: f64,
    pub running_utilization: f64,
    pub alarm_utilization: f64,
}

/// Persisted "should this device be polled" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorFlag {
    pub device_id: i64,
    pub is_monitoring: bool,
}
