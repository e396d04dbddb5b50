//! Driver registry.
//!
//! Maps driver names to their descriptors and caches initialized instances
//! keyed by driver name plus a hash of the canonical configuration, so two
//! equivalent configurations share one instance regardless of key order.

mod discovery;
mod plugin;

pub use discovery::DriverDiscovery;
pub use plugin::PluginManager;

use crate::clock::SharedClock;
use crate::config::{resolve_connection, ConnectionConfig};
use crate::driver::{
    ConfigSchema, DriverConfig, DriverContext, DriverInfo, FailedJobLogger, HealthStatus,
    QueueDriver, RegisteredDriver,
};
use crate::error::{JobError, JobResult};
use crate::failed::QueueResolver;
use crate::metrics::DriverMetrics;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Constructor for a driver instance.
pub type DriverFactory = Arc<dyn Fn(DriverContext) -> Box<dyn QueueDriver> + Send + Sync>;

/// Compile-time constructor table entry.
#[derive(Clone)]
pub struct DriverDescriptor {
    pub info: DriverInfo,
    pub schema: ConfigSchema,
    factory: DriverFactory,
}

impl DriverDescriptor {
    pub fn new(info: DriverInfo, schema: ConfigSchema, factory: DriverFactory) -> Self {
        Self {
            info,
            schema,
            factory,
        }
    }

    /// Descriptor for a compile-time driver type.
    pub fn of<D: RegisteredDriver>() -> Self {
        Self::new(
            D::driver_info(),
            D::schema(),
            Arc::new(|ctx: DriverContext| Box::new(D::create(ctx)) as Box<dyn QueueDriver>),
        )
    }

    pub fn factory(&self) -> DriverFactory {
        Arc::clone(&self.factory)
    }

    /// Builds an uninitialized instance.
    pub fn create(&self, ctx: DriverContext) -> Box<dyn QueueDriver> {
        (self.factory)(ctx)
    }
}

impl fmt::Debug for DriverDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverDescriptor")
            .field("info", &self.info)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

type InstanceCell = Arc<OnceCell<Arc<dyn QueueDriver>>>;

/// Single source of truth for available drivers and their live instances.
pub struct DriverRegistry {
    discovery: DriverDiscovery,
    drivers: RwLock<HashMap<String, DriverDescriptor>>,
    instances: RwLock<HashMap<String, InstanceCell>>,
    failure_logger: RwLock<Option<Arc<dyn FailedJobLogger>>>,
    clock: SharedClock,
}

impl DriverRegistry {
    /// Creates a registry and runs discovery.
    pub fn new(plugins: Arc<PluginManager>, clock: SharedClock) -> Self {
        let discovery = DriverDiscovery::new(plugins);
        let drivers = discovery.discover();
        Self {
            discovery,
            drivers: RwLock::new(drivers),
            instances: RwLock::new(HashMap::new()),
            failure_logger: RwLock::new(None),
            clock,
        }
    }

    /// Attaches the sink for terminally failed jobs to instances created from
    /// now on.
    pub fn set_failure_logger(&self, logger: Arc<dyn FailedJobLogger>) {
        *self.failure_logger.write() = Some(logger);
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        self.discovery.plugins()
    }

    fn driver_context(&self) -> DriverContext {
        let ctx = DriverContext::new(Arc::clone(&self.clock));
        match self.failure_logger.read().as_ref() {
            Some(logger) => ctx.with_failure_logger(Arc::clone(logger)),
            None => ctx,
        }
    }

    fn descriptor(&self, name: &str) -> JobResult<DriverDescriptor> {
        self.drivers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::DriverNotFound(name.to_string()))
    }

    /// Returns an initialized driver, creating it on first use.
    ///
    /// Configuration is validated before any instance is constructed.
    /// Concurrent calls for the same configuration construct it once.
    pub async fn get_driver(&self, name: &str, config: &DriverConfig) -> JobResult<Arc<dyn QueueDriver>> {
        let descriptor = self.descriptor(name)?;
        descriptor
            .schema
            .validate(config)
            .map_err(|errors| JobError::invalid_configuration(name, errors))?;

        let key = cache_key(name, config);
        let cell = {
            let existing = self.instances.read().get(&key).cloned();
            match existing {
                Some(cell) => cell,
                None => Arc::clone(
                    self.instances
                        .write()
                        .entry(key.clone())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                ),
            }
        };

        let driver = cell
            .get_or_try_init(|| async {
                let mut driver = descriptor.create(self.driver_context());
                driver.initialize(config).await?;
                info!(driver = %name, cache_key = %key, "Instantiated queue driver");
                Ok::<_, JobError>(Arc::from(driver))
            })
            .await?;

        Ok(Arc::clone(driver))
    }

    /// Validates a configuration against a driver's schema.
    pub fn validate_config(&self, name: &str, config: &DriverConfig) -> JobResult<()> {
        self.descriptor(name)?
            .schema
            .validate(config)
            .map_err(|errors| JobError::invalid_configuration(name, errors))
    }

    pub fn has_driver(&self, name: &str) -> bool {
        self.drivers.read().contains_key(name)
    }

    pub fn driver_info(&self, name: &str) -> Option<DriverInfo> {
        self.drivers.read().get(name).map(|d| d.info.clone())
    }

    pub fn driver_schema(&self, name: &str) -> Option<ConfigSchema> {
        self.drivers.read().get(name).map(|d| d.schema.clone())
    }

    /// Metadata of every available driver, sorted by name.
    pub fn available_drivers(&self) -> Vec<DriverInfo> {
        let drivers = self.drivers.read();
        let mut names: Vec<&String> = drivers.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| drivers.get(name))
            .map(|d| d.info.clone())
            .collect()
    }

    /// Evicts cached instances of one driver, or all of them.
    pub fn clear_cache(&self, name: Option<&str>) -> usize {
        let mut instances = self.instances.write();
        let before = instances.len();
        match name {
            Some(name) => {
                let prefix = format!("{name}:");
                instances.retain(|key, _| !key.starts_with(&prefix));
            }
            None => instances.clear(),
        }
        let evicted = before - instances.len();
        debug!(driver = ?name, evicted, "Cleared driver cache");
        evicted
    }

    /// Number of cached instances.
    pub fn cached_instances(&self) -> usize {
        self.instances.read().len()
    }

    /// Re-runs discovery and drops instances of drivers that disappeared.
    pub fn refresh(&self) {
        let drivers = self.discovery.discover();
        {
            let mut instances = self.instances.write();
            instances.retain(|key, _| {
                key.split_once(':')
                    .is_some_and(|(name, _)| drivers.contains_key(name))
            });
        }
        *self.drivers.write() = drivers;
        info!("Driver registry refreshed");
    }

    /// Probes every cached instance, keyed by cache key.
    pub async fn health_check_all(&self) -> BTreeMap<String, HealthStatus> {
        let instances: Vec<(String, Arc<dyn QueueDriver>)> = self
            .instances
            .read()
            .iter()
            .filter_map(|(key, cell)| cell.get().map(|d| (key.clone(), Arc::clone(d))))
            .collect();

        join_all(instances.into_iter().map(|(key, driver)| async move {
            let status = driver.health_check().await;
            DriverMetrics::record_health(driver.name(), &status);
            (key, status)
        }))
        .await
        .into_iter()
        .collect()
    }
}

/// Cache key: driver name plus the SHA-256 of the canonical configuration.
pub fn cache_key(name: &str, config: &DriverConfig) -> String {
    let mut canonical = String::new();
    write_canonical(&Value::Object(config.clone()), &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{name}:{}", hex::encode(digest))
}

/// Serializes JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Resolves connection names to drivers through the registry.
///
/// Holds a weak reference so the registry may own a failure logger that
/// uses this resolver.
pub struct ConnectionResolver {
    registry: Weak<DriverRegistry>,
    connections: HashMap<String, ConnectionConfig>,
}

impl ConnectionResolver {
    pub fn new(registry: &Arc<DriverRegistry>, connections: HashMap<String, ConnectionConfig>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            connections,
        }
    }
}

#[async_trait]
impl QueueResolver for ConnectionResolver {
    async fn resolve(&self, connection: &str) -> JobResult<Arc<dyn QueueDriver>> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| JobError::Internal("Driver registry has been dropped".into()))?;

        let conn = resolve_connection(&self.connections, connection);
        registry.get_driver(&conn.driver, &conn.options).await
    }
}
