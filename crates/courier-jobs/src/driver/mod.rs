//! Queue driver contract and shipped drivers.
//!
//! A driver owns the stored state of its jobs. `pop` must be atomic at the
//! backend level so concurrent workers never receive the same job. Ordering
//! guarantees differ per driver and are documented on each one.

mod database;
mod info;
mod memory;
mod redis;
mod schema;

pub use self::database::DatabaseDriver;
pub use self::info::{DriverInfo, HealthState, HealthStatus};
pub use self::memory::MemoryDriver;
pub use self::redis::{RedisDriver, RedisQueueKeys};
pub use self::schema::{ConfigSchema, FieldSpec, FieldType, FieldValidator};

use crate::clock::{system_clock, SharedClock};
use crate::error::{JobError, JobResult};
use crate::failure::JobFailure;
use crate::job::{Job, JobId, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, DEFAULT_TIMEOUT_SECONDS};
use crate::payload::JobPayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Raw driver options as read from configuration.
pub type DriverConfig = Map<String, Value>;

/// Backend-specific statistics.
pub type DriverStats = BTreeMap<String, Value>;

/// Default grace period, in seconds, before an expired reservation is
/// handed out again.
pub const DEFAULT_RETRY_AFTER: u64 = 30;

/// Sink for terminally failed jobs.
#[async_trait]
pub trait FailedJobLogger: Send + Sync {
    /// Records a failure and returns the record's uuid. Never fails.
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        failure: &JobFailure,
    ) -> String;
}

/// A job to be pushed.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_class: String,
    pub data: Value,
    pub queue: Option<String>,
    pub delay: Duration,
    pub max_attempts: u32,
    pub timeout_seconds: u64,
    pub priority: i32,
    pub batch_uuid: Option<String>,
}

impl NewJob {
    /// Creates a job with default attempts and timeout.
    pub fn new(job_class: impl Into<String>, data: Value) -> Self {
        Self {
            job_class: job_class.into(),
            data,
            queue: None,
            delay: Duration::ZERO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            priority: 0,
            batch_uuid: None,
        }
    }

    #[must_use]
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn batch(mut self, batch_uuid: impl Into<String>) -> Self {
        self.batch_uuid = Some(batch_uuid.into());
        self
    }

    /// Checks the job can be stored.
    pub fn validate(&self) -> JobResult<()> {
        if self.job_class.trim().is_empty() {
            return Err(JobError::InvalidPayload("Job class cannot be empty".into()));
        }
        if !(self.data.is_object() || self.data.is_array()) {
            return Err(JobError::InvalidPayload(
                "Job data must be a JSON object or array".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(JobError::InvalidPayload("max_attempts must be at least 1".into()));
        }
        if self.timeout_seconds == 0 {
            return Err(JobError::InvalidPayload("timeout_seconds must be at least 1".into()));
        }
        Ok(())
    }

    /// Builds the stored job. The queue falls back to `default_queue`.
    pub fn into_job(self, default_queue: &str, now: DateTime<Utc>) -> Job {
        let available_at = now
            + chrono::Duration::from_std(self.delay).unwrap_or_else(|_| chrono::Duration::zero());
        Job {
            id: JobId::new(),
            queue: self.queue.unwrap_or_else(|| default_queue.to_string()),
            job_class: self.job_class,
            data: self.data,
            attempts: 0,
            max_attempts: self.max_attempts,
            timeout_seconds: self.timeout_seconds,
            priority: self.priority,
            batch_uuid: self.batch_uuid,
            created_at: now,
            available_at,
            reserved_at: None,
        }
    }
}

/// Outcome of a bulk push, aligned with the input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkPushResult {
    /// One entry per input job; `None` marks a failed entry.
    pub ids: Vec<Option<JobId>>,
}

impl BulkPushResult {
    /// Ids of the jobs that were stored, in input order.
    pub fn succeeded(&self) -> Vec<JobId> {
        self.ids.iter().flatten().cloned().collect()
    }

    /// Indices of the jobs that failed.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.ids
            .iter()
            .enumerate()
            .filter_map(|(i, id)| id.is_none().then_some(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.ids.iter().all(Option::is_some)
    }

    /// Converts a partial result into [`JobError::BulkPartialFailure`].
    pub fn into_result(self) -> JobResult<Vec<JobId>> {
        let failed = self.failed_indices();
        if failed.is_empty() {
            Ok(self.ids.into_iter().flatten().collect())
        } else {
            Err(JobError::BulkPartialFailure {
                ids: self.ids,
                failed,
            })
        }
    }
}

/// Backend abstraction every queue driver implements.
///
/// Any method other than `health_check` may fail with a backend error. Callers
/// treat those as infrastructure failures, distinct from job failures.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Registered driver name.
    fn name(&self) -> &str;

    /// One-time setup from validated configuration.
    async fn initialize(&mut self, config: &DriverConfig) -> JobResult<()>;

    /// Stores a job and returns its id.
    async fn enqueue(&self, job: NewJob) -> JobResult<JobId>;

    /// Pushes a job for immediate visibility.
    async fn push(&self, job_class: &str, data: Value, queue: Option<&str>) -> JobResult<JobId> {
        let mut job = NewJob::new(job_class, data);
        job.queue = queue.map(str::to_string);
        self.enqueue(job).await
    }

    /// Pushes a job that becomes visible after `delay` from now.
    async fn later(
        &self,
        delay: Duration,
        job_class: &str,
        data: Value,
        queue: Option<&str>,
    ) -> JobResult<JobId> {
        let mut job = NewJob::new(job_class, data).delay(delay);
        job.queue = queue.map(str::to_string);
        self.enqueue(job).await
    }

    /// Claims one visible job, or returns `None` when the queue is empty.
    async fn pop(&self, queue: Option<&str>) -> JobResult<Option<Job>>;

    /// Returns a reserved job to the queue after `delay`. Stores the job's
    /// current attempt count.
    async fn release(&self, job: &Job, delay: Duration) -> JobResult<()>;

    /// Removes a job. Deleting a missing job succeeds.
    async fn delete(&self, job: &Job) -> JobResult<()>;

    /// Approximate number of pending jobs.
    async fn size(&self, queue: Option<&str>) -> JobResult<u64>;

    /// Pushes many jobs. Invalid or failed entries are `None` in the result;
    /// the others stay stored.
    async fn bulk(&self, jobs: Vec<NewJob>, queue: Option<&str>) -> JobResult<BulkPushResult> {
        let mut ids = Vec::with_capacity(jobs.len());
        for (index, mut job) in jobs.into_iter().enumerate() {
            if job.queue.is_none() {
                job.queue = queue.map(str::to_string);
            }
            match job.validate() {
                Ok(()) => match self.enqueue(job).await {
                    Ok(id) => ids.push(Some(id)),
                    Err(e) => {
                        warn!(driver = %self.name(), index, error = %e, "Bulk entry failed");
                        ids.push(None);
                    }
                },
                Err(e) => {
                    warn!(driver = %self.name(), index, error = %e, "Bulk entry rejected");
                    ids.push(None);
                }
            }
        }
        Ok(BulkPushResult { ids })
    }

    /// Deletes every job in a queue and returns how many were removed.
    async fn purge(&self, queue: Option<&str>) -> JobResult<u64>;

    /// Backend-specific statistics.
    async fn stats(&self, queue: Option<&str>) -> JobResult<DriverStats>;

    /// Hands a terminally failed job to failure tracking.
    async fn failed(&self, job: &Job, failure: &JobFailure) -> JobResult<()>;

    /// Cheap connectivity probe. Never fails; problems are reported as
    /// unhealthy.
    async fn health_check(&self) -> HealthStatus;

    /// Supported feature names.
    fn features(&self) -> Vec<String>;

    /// Accepted configuration.
    fn config_schema(&self) -> ConfigSchema;

    /// Queue used when none is given.
    fn default_queue(&self) -> &str {
        DEFAULT_QUEUE
    }
}

/// Construction context handed to driver factories.
#[derive(Clone)]
pub struct DriverContext {
    pub failure_logger: Option<Arc<dyn FailedJobLogger>>,
    pub clock: SharedClock,
}

impl DriverContext {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            failure_logger: None,
            clock,
        }
    }

    #[must_use]
    pub fn with_failure_logger(mut self, logger: Arc<dyn FailedJobLogger>) -> Self {
        self.failure_logger = Some(logger);
        self
    }
}

impl Default for DriverContext {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("has_failure_logger", &self.failure_logger.is_some())
            .finish_non_exhaustive()
    }
}

/// A driver known at compile time.
///
/// Metadata and schema are static so configuration can be validated before
/// an instance exists.
pub trait RegisteredDriver: QueueDriver + Sized + 'static {
    /// Registered name.
    const NAME: &'static str;

    fn driver_info() -> DriverInfo;

    fn schema() -> ConfigSchema;

    fn create(ctx: DriverContext) -> Self;
}

/// Options every shipped driver understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommonOptions {
    pub connection: String,
    pub queue: String,
    pub retry_after: u64,
}

impl CommonOptions {
    pub(crate) fn new(driver: &str) -> Self {
        Self {
            connection: driver.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            retry_after: DEFAULT_RETRY_AFTER,
        }
    }

    pub(crate) fn read(driver: &str, config: &DriverConfig) -> Self {
        let defaults = Self::new(driver);
        Self {
            connection: string_option(config, "connection").unwrap_or(defaults.connection),
            queue: string_option(config, "queue").unwrap_or(defaults.queue),
            retry_after: config
                .get("retry_after")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.retry_after),
        }
    }

    /// Resolves an optional queue argument.
    pub(crate) fn queue_or_default<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.filter(|q| !q.is_empty()).unwrap_or(&self.queue)
    }

    /// Schema entries shared by every shipped driver.
    pub(crate) fn schema() -> ConfigSchema {
        ConfigSchema::new()
            .field(
                "connection",
                FieldSpec::optional(FieldType::String).description("Connection name used in failure records"),
            )
            .field(
                "queue",
                FieldSpec::optional(FieldType::String)
                    .description("Default queue name")
                    .default_value(DEFAULT_QUEUE),
            )
            .field(
                "retry_after",
                FieldSpec::optional(FieldType::Int)
                    .description("Seconds past a job's timeout before its reservation expires")
                    .default_value(DEFAULT_RETRY_AFTER),
            )
    }
}

pub(crate) fn string_option(config: &DriverConfig, key: &str) -> Option<String> {
    config
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Routes a failed job to the failure logger, if one is attached.
pub(crate) async fn report_failure(
    logger: Option<&Arc<dyn FailedJobLogger>>,
    connection: &str,
    job: &Job,
    failure: &JobFailure,
) -> JobResult<()> {
    let Some(logger) = logger else {
        error!(
            job_id = %job.id,
            queue = %job.queue,
            failure = %failure,
            "Job failed with no failure logger attached"
        );
        return Ok(());
    };

    let payload = JobPayload::from(job).to_json()?;
    logger.log(connection, &job.queue, &payload, failure).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_job_validation() {
        assert!(NewJob::new("SendEmail", json!({})).validate().is_ok());
        assert!(NewJob::new("", json!({})).validate().is_err());
        assert!(NewJob::new("SendEmail", json!("text")).validate().is_err());
        assert!(NewJob::new("SendEmail", json!([])).max_attempts(0).validate().is_err());
    }

    #[test]
    fn test_into_job_applies_delay_and_default_queue() {
        let now = Utc::now();
        let job = NewJob::new("SendEmail", json!({}))
            .delay(Duration::from_secs(30))
            .into_job("emails", now);
        assert_eq!(job.queue, "emails");
        assert_eq!(job.attempts, 0);
        assert_eq!(job.available_at, now + chrono::Duration::seconds(30));
    }

    #[test]
    fn test_bulk_result_reports_failed_indices() {
        let result = BulkPushResult {
            ids: vec![Some(JobId::new()), None, Some(JobId::new())],
        };
        assert_eq!(result.failed_indices(), vec![1]);
        assert_eq!(result.succeeded().len(), 2);
        assert!(!result.is_complete());

        match result.into_result() {
            Err(JobError::BulkPartialFailure { ids, failed }) => {
                assert_eq!(ids.len(), 3);
                assert_eq!(failed, vec![1]);
            }
            other => panic!("Expected BulkPartialFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_common_options() {
        let config: DriverConfig = serde_json::from_value(json!({
            "connection": "primary",
            "retry_after": 120
        }))
        .unwrap();
        let options = CommonOptions::read("database", &config);
        assert_eq!(options.connection, "primary");
        assert_eq!(options.queue, "default");
        assert_eq!(options.retry_after, 120);
        assert_eq!(options.queue_or_default(Some("")), "default");
        assert_eq!(options.queue_or_default(Some("mail")), "mail");
    }
}
