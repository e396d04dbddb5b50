//! Runtime registration of third-party drivers.

use super::DriverDescriptor;
use crate::driver::RegisteredDriver;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{info, warn};

/// Holds drivers registered at runtime by extensions.
///
/// Registrations take effect in a [`super::DriverRegistry`] on its next
/// `refresh()`.
#[derive(Default)]
pub struct PluginManager {
    drivers: RwLock<HashMap<String, DriverDescriptor>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver under `name`, replacing any earlier registration.
    pub fn register(&self, name: impl Into<String>, descriptor: DriverDescriptor) {
        let name = name.into();
        let version = descriptor.info.version.clone();
        if self.drivers.write().insert(name.clone(), descriptor).is_some() {
            warn!(driver = %name, "Replaced previously registered plugin driver");
        }
        info!(driver = %name, version = %version, "Registered plugin driver");
    }

    /// Registers a compile-time driver type under its own name.
    pub fn register_driver<D: RegisteredDriver>(&self) {
        self.register(D::NAME, DriverDescriptor::of::<D>());
    }

    /// Removes a registration.
    pub fn unregister(&self, name: &str) -> Option<DriverDescriptor> {
        let removed = self.drivers.write().remove(name);
        if removed.is_some() {
            info!(driver = %name, "Unregistered plugin driver");
        }
        removed
    }

    /// Returns a registration by name.
    pub fn get(&self, name: &str) -> Option<DriverDescriptor> {
        self.drivers.read().get(name).cloned()
    }

    /// Returns registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns every registration.
    pub fn registrations(&self) -> Vec<(String, DriverDescriptor)> {
        self.drivers
            .read()
            .iter()
            .map(|(name, descriptor)| (name.clone(), descriptor.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;

    #[test]
    fn test_register_and_unregister() {
        let plugins = PluginManager::new();
        plugins.register("fast", DriverDescriptor::of::<MemoryDriver>());
        plugins.register_driver::<MemoryDriver>();

        assert_eq!(plugins.list(), vec!["fast".to_string(), "memory".to_string()]);
        assert_eq!(plugins.get("fast").unwrap().info.name, "memory");

        assert!(plugins.unregister("fast").is_some());
        assert!(plugins.unregister("fast").is_none());
        assert_eq!(plugins.len(), 1);
    }
}
