//! Device configuration service and change bus.

use crate::db::{Category, DbError, Device, DeviceStore};
use crate::driver::DriverRegistry;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

const CHANGE_BUS_CAPACITY: usize = 64;

/// Device service error types.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("store error: {0}")]
    Store(#[from] DbError),
    #[error("unknown driver: {0}")]
    UnknownDriver(String),
    #[error("driver {driver} does not support category {}", .category.as_str())]
    UnsupportedCategory { driver: String, category: Category },
}

/// Published after a device write has been committed.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceChange {
    Added(Device),
    Updated(Device),
    Deleted(i64),
}

impl DeviceChange {
    pub fn device_id(&self) -> i64 {
        match self {
            DeviceChange::Added(d) | DeviceChange::Updated(d) => d.id,
            DeviceChange::Deleted(id) => *id,
        }
    }
}

pub struct DeviceService {
    store: Arc<dyn DeviceStore>,
    registry: Arc<DriverRegistry>,
    changes: broadcast::Sender<DeviceChange>,
}

impl DeviceService {
    pub fn new(store: Arc<dyn DeviceStore>, registry: Arc<DriverRegistry>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        Self {
            store,
            registry,
            changes,
        }
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    fn validate(&self, device: &Device) -> Result<(), DeviceError> {
        let driver = self
            .registry
            .get(&device.driver)
            .ok_or_else(|| DeviceError::UnknownDriver(device.driver.clone()))?;
        if !driver.metadata().supports(device.category) {
            return Err(DeviceError::UnsupportedCategory {
                driver: device.driver.clone(),
                category: device.category,
            });
        }
        Ok(())
    }

    fn notify(&self, change: DeviceChange) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }

    pub fn add(&self, mut device: Device) -> Result<Device, DeviceError> {
        self.validate(&device)?;
        self.store.add_device(&mut device)?;
        tracing::info!(device_id = device.id, "Added device {}", device.name);
        self.notify(DeviceChange::Added(device.clone()));
        Ok(device)
    }

    pub fn update(&self, device: Device) -> Result<Device, DeviceError> {
        self.validate(&device)?;
        self.store.update_device(&device)?;
        tracing::info!(device_id = device.id, "Updated device {}", device.name);
        self.notify(DeviceChange::Updated(device.clone()));
        Ok(device)
    }

    /// Delete a device and its history. Returns `false` if it did not exist.
    pub fn delete(&self, id: i64) -> Result<bool, DeviceError> {
        if self.store.get_device(id)?.is_none() {
            return Ok(false);
        }
        self.store.delete_device(id)?;
        tracing::info!(device_id = id, "Deleted device");
        self.notify(DeviceChange::Deleted(id));
        Ok(true)
    }

    pub fn get(&self, id: i64) -> Result<Option<Device>, DeviceError> {
        Ok(self.store.get_device(id)?)
    }

    pub fn list(&self) -> Result<Vec<Device>, DeviceError> {
        Ok(self.store.get_devices()?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceChange> {
        self.changes.subscribe()
    }
}
