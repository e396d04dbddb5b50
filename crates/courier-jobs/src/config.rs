//! Job queue configuration.
//!
//! Read from the `jobs` section of the layered configuration. Every field has
//! a default, so an empty section is valid.

use crate::driver::DriverConfig;
use crate::job::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, DEFAULT_TIMEOUT_SECONDS};
use crate::retry::RetryStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the job queue system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Connection used when none is named.
    #[serde(default = "default_connection")]
    pub default_driver: String,

    /// Named connections.
    #[serde(default)]
    pub drivers: HashMap<String, ConnectionConfig>,

    /// Worker configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Backoff and job defaults.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Failed-job tracking.
    #[serde(default)]
    pub failed: FailedJobsConfig,

    /// Cron scheduler.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_driver: default_connection(),
            drivers: HashMap::new(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            failed: FailedJobsConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl JobsConfig {
    /// Looks up a named connection, falling back to a connection whose driver
    /// has the same name and no options.
    pub fn connection(&self, name: &str) -> ConnectionConfig {
        resolve_connection(&self.drivers, name)
    }
}

/// Resolves a connection name against configured connections.
///
/// A configured connection gets its own name as the `connection` option
/// unless it sets one, so failure records name the connection rather than
/// the driver.
pub fn resolve_connection(drivers: &HashMap<String, ConnectionConfig>, name: &str) -> ConnectionConfig {
    match drivers.get(name) {
        Some(conn) => {
            let mut conn = conn.clone();
            conn.options
                .entry("connection")
                .or_insert_with(|| serde_json::Value::from(name));
            conn
        }
        None => ConnectionConfig {
            driver: name.to_string(),
            options: DriverConfig::new(),
        },
    }
}

fn default_connection() -> String {
    "database".to_string()
}

/// One named queue connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Registered driver name.
    pub driver: String,

    /// Raw options validated against the driver's schema.
    #[serde(default)]
    pub options: DriverConfig,
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Queues to poll, in order.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Sleep after an empty poll, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Sleep after an infrastructure error, in milliseconds.
    #[serde(default = "default_sleep_on_error")]
    pub sleep_on_error_ms: u64,

    /// Grace period for in-flight jobs on shutdown, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queues: default_queues(),
            poll_interval_ms: default_poll_interval(),
            sleep_on_error_ms: default_sleep_on_error(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl WorkerConfig {
    /// Returns the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the error back-off as a Duration.
    pub fn sleep_on_error(&self) -> Duration {
        Duration::from_millis(self.sleep_on_error_ms)
    }

    /// Returns the shutdown timeout as a Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
        .max(1)
}

fn default_queues() -> Vec<String> {
    vec![DEFAULT_QUEUE.to_string()]
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_sleep_on_error() -> u64 {
    5_000
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Backoff policy and job defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Backoff strategy.
    #[serde(default = "default_strategy")]
    pub strategy: RetryStrategy,

    /// First retry delay in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Delay cap in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Exponential multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Add random jitter.
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Jitter factor (0.0 to 1.0).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Default `max_attempts` for pushed jobs.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Default `timeout_seconds` for pushed jobs.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: true,
            jitter_factor: default_jitter_factor(),
            max_attempts: default_max_attempts(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_strategy() -> RetryStrategy {
    RetryStrategy::Exponential
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    3_600_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

/// Failed-job tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJobsConfig {
    /// Maximum manual retries per failed record.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Records older than this are removed by cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Job classes that may be reconstructed from a stored payload.
    /// Empty means any class.
    #[serde(default)]
    pub payload_allow_list: Vec<String>,
}

impl Default for FailedJobsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retention_days: default_retention_days(),
            payload_allow_list: Vec::new(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_retention_days() -> u32 {
    30
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable the scheduler loop.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between due-job checks.
    #[serde(default = "default_scheduler_poll")]
    pub poll_interval_secs: u64,

    /// Lease lifetime per scheduled job, in seconds.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Guard each execution with a Redis lease.
    #[serde(default)]
    pub use_lease_lock: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_scheduler_poll(),
            lease_ttl_secs: default_lease_ttl(),
            use_lease_lock: false,
        }
    }
}

impl SchedulerConfig {
    /// Returns the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Returns the lease lifetime as a Duration.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(1))
    }
}

fn default_scheduler_poll() -> u64 {
    60
}

fn default_lease_ttl() -> u64 {
    300
}
