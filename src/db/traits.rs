//! Storage contracts consumed by the timeline engine and the coordinator.
//!
//! Implementations must be safe to call from many device loops at once.
//! Each call is expected to be atomic with respect to readers.

use chrono::{DateTime, Utc};

use super::models::{Device, MonitorFlag, RuntimeInterval};
use super::store::DbError;

/// Ordered set of runtime intervals per device.
pub trait RuntimeStore: Send + Sync {
    /// Insert a new interval.
    fn append(&self, interval: &RuntimeInterval) -> Result<(), DbError>;

    /// Rewrite status and end time of the interval keyed by `(device_id, start_time)`.
    fn update_most_recent(&self, interval: &RuntimeInterval) -> Result<(), DbError>;

    /// Close `closed` and open `opened` as one unit.
    ///
    /// The default runs the two writes back to back; backends that can do
    /// better should override it so a failure never leaves a closed interval
    /// without its successor.
    fn transition(&self, closed: &RuntimeInterval, opened: &RuntimeInterval) -> Result<(), DbError> {
        self.update_most_recent(closed)?;
        self.append(opened)
    }

    /// Intervals overlapping `[from, to)`, ordered by start time.
    fn query_range(
        &self,
        device_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RuntimeInterval>, DbError>;

    fn get_latest(&self, device_id: i64) -> Result<Option<RuntimeInterval>, DbError>;

    fn get_earliest(&self, device_id: i64) -> Result<Option<RuntimeInterval>, DbError>;

    /// Delete closed intervals that ended before `cutoff`. Returns rows removed.
    fn delete_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError>;
}

/// Persisted monitor flags, one per device.
pub trait MonitorFlagStore: Send + Sync {
    fn get_flag(&self, device_id: i64) -> Result<Option<MonitorFlag>, DbError>;

    fn upsert_flag(&self, flag: &MonitorFlag) -> Result<(), DbError>;

    fn delete_flag(&self, device_id: i64) -> Result<(), DbError>;

    fn get_flags(&self) -> Result<Vec<MonitorFlag>, DbError>;
}

/// Device settings.
pub trait DeviceStore: Send + Sync {
    fn add_device(&self, device: &mut Device) -> Result<i64, DbError>;

    fn update_device(&self, device: &Device) -> Result<(), DbError>;

    fn get_device(&self, id: i64) -> Result<Option<Device>, DbError>;

    fn get_devices(&self) -> Result<Vec<Device>, DbError>;

    fn delete_device(&self, id: i64) -> Result<(), DbError>;
}
