//! Device drivers.
//!
//! A driver turns a device's configuration into one status snapshot. Drivers
//! are registered explicitly in a [`DriverRegistry`]; there is no discovery.

mod demo;
mod http;

pub use demo::*;
pub use http::*;

use crate::db::{Category, Device, Snapshot};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Driver error types.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("driver timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Describes one connection or variable setting a driver understands.
#[derive(Debug, Clone, Serialize)]
pub struct SettingDescriptor {
    pub key: &'static str,
    pub display_name: &'static str,
    pub note: &'static str,
    pub default: &'static str,
}

/// Static description of a driver, served to configuration front ends.
#[derive(Debug, Clone, Serialize)]
pub struct DriverMetadata {
    pub name: &'static str,
    pub display_name: &'static str,
    pub categories: Vec<Category>,
    pub connection_settings: Vec<SettingDescriptor>,
    pub variable_settings: Vec<SettingDescriptor>,
}

impl DriverMetadata {
    pub fn supports(&self, category: Category) -> bool {
        self.categories.contains(&category)
    }
}

/// Produces point-in-time snapshots for devices it is configured for.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn metadata(&self) -> DriverMetadata;

    async fn snapshot(&self, device: &Device) -> Result<Snapshot, DriverError>;
}

/// Table of available drivers keyed by name.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Arc<dyn DeviceDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every driver shipped with runtrail.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DemoDriver::new()));
        registry.register(Arc::new(HttpDriver::new()));
        registry
    }

    /// Add a driver, replacing any previous driver with the same name.
    pub fn register(&mut self, driver: Arc<dyn DeviceDriver>) {
        let name = driver.metadata().name;
        self.drivers.insert(name, driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeviceDriver>> {
        self.drivers.get(name).cloned()
    }

    /// Metadata of every registered driver, sorted by name.
    pub fn metadata(&self) -> Vec<DriverMetadata> {
        let mut all: Vec<_> = self.drivers.values().map(|d| d.metadata()).collect();
        all.sort_by_key(|m| m.name);
        all
    }

    /// Metadata of the drivers that can serve `category`.
    pub fn drivers_for(&self, category: Category) -> Vec<DriverMetadata> {
        self.metadata()
            .into_iter()
            .filter(|m| m.supports(category))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = DriverRegistry::builtin();
        assert!(registry.get("demo").is_some());
        assert!(registry.get("http").is_some());
        assert!(registry.get("focas").is_none());

        let names: Vec<_> = registry.metadata().iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["demo", "http"]);
    }

    #[test]
    fn test_drivers_for_category() {
        let registry = DriverRegistry::builtin();
        for category in [Category::Machine, Category::Magazine, Category::Robot] {
            let drivers = registry.drivers_for(category);
            assert!(drivers.iter().any(|m| m.name == "demo"));
        }
    }
}
