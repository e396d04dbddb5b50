//! Driver discovery.
//!
//! Built-in drivers are listed at compile time. Plugin registrations are
//! merged on top and may replace a built-in name.

use super::{DriverDescriptor, PluginManager};
use crate::driver::{DatabaseDriver, MemoryDriver, RedisDriver};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Produces the driver table from built-ins and plugins.
#[derive(Clone)]
pub struct DriverDiscovery {
    plugins: Arc<PluginManager>,
}

impl DriverDiscovery {
    pub fn new(plugins: Arc<PluginManager>) -> Self {
        Self { plugins }
    }

    /// Drivers shipped with the crate.
    pub fn builtin() -> Vec<(String, DriverDescriptor)> {
        [
            DriverDescriptor::of::<MemoryDriver>(),
            DriverDescriptor::of::<DatabaseDriver>(),
            DriverDescriptor::of::<RedisDriver>(),
        ]
        .into_iter()
        .map(|descriptor| (descriptor.info.name.clone(), descriptor))
        .collect()
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    /// Builds the driver table.
    pub fn discover(&self) -> HashMap<String, DriverDescriptor> {
        let mut drivers: HashMap<String, DriverDescriptor> = Self::builtin().into_iter().collect();
        let builtin_count = drivers.len();

        for (name, descriptor) in self.plugins.registrations() {
            if drivers.insert(name.clone(), descriptor).is_some() {
                warn!(driver = %name, "Plugin driver overrides a built-in driver");
            }
        }

        info!(
            builtin = builtin_count,
            plugins = self.plugins.len(),
            total = drivers.len(),
            "Discovered queue drivers"
        );
        drivers
    }
}
