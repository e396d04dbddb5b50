//! Failure logging, retry orchestration and analytics.

use super::{
    FailedJobFilters, FailedJobRecord, FailedJobStats, FailedJobStore, FailurePatterns, QueueResolver,
};
use crate::clock::SharedClock;
use crate::config::FailedJobsConfig;
use crate::driver::{FailedJobLogger, NewJob};
use crate::error::{JobError, JobResult};
use crate::failure::JobFailure;
use crate::metrics::FailedJobMetrics;
use crate::payload::PayloadCodec;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const TOP_PATTERNS: usize = 10;
const PATTERN_WINDOW_DAYS: i64 = 7;
const UNKNOWN_JOB_CLASS: &str = "unknown";

const CSV_HEADER: [&str; 12] = [
    "uuid",
    "connection",
    "queue",
    "job_class",
    "job_uuid",
    "exception_class",
    "exception_message",
    "failed_at",
    "attempts",
    "retry_count",
    "retryable",
    "last_retry_at",
];

/// Output format for [`FailedJobProvider::export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(JobError::Configuration(format!("Unsupported export format: {other}"))),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Csv => write!(f, "csv"),
        }
    }
}

/// Durable record of terminal job failures.
///
/// `log`, `retry` and `retry_all` never return errors: logging is best effort
/// and retries report `false` for anything that could not be requeued.
pub struct FailedJobProvider {
    store: Arc<dyn FailedJobStore>,
    resolver: Arc<dyn QueueResolver>,
    codec: PayloadCodec,
    max_retries: u32,
    retention_days: u32,
    clock: SharedClock,
}

impl FailedJobProvider {
    pub fn new(
        store: Arc<dyn FailedJobStore>,
        resolver: Arc<dyn QueueResolver>,
        config: &FailedJobsConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            resolver,
            codec: PayloadCodec::new(config.payload_allow_list.iter().cloned()),
            max_retries: config.max_retries,
            retention_days: config.retention_days,
            clock,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Records a failure and returns the record's uuid.
    ///
    /// Retryability is decided here from the failure value, since it is not
    /// available at retry time.
    pub async fn log(&self, connection: &str, queue: &str, payload: &str, failure: &JobFailure) -> String {
        let uuid = Uuid::new_v4().to_string();
        let envelope = PayloadCodec::default().decode(payload).ok();

        let record = FailedJobRecord {
            uuid: uuid.clone(),
            connection: connection.to_string(),
            queue: queue.to_string(),
            payload: payload.to_string(),
            exception_class: failure.class.clone(),
            exception_message: failure.message.clone(),
            exception_trace: failure.trace.clone(),
            failed_at: self.clock.now(),
            retry_count: 0,
            retryable: failure.is_retryable(),
            job_class: envelope
                .as_ref()
                .map_or_else(|| UNKNOWN_JOB_CLASS.to_string(), |p| p.job_class.clone()),
            job_uuid: envelope.as_ref().map(|p| p.uuid.to_string()),
            attempts: envelope.as_ref().map_or(0, |p| p.attempts),
            last_retry_at: None,
            requeued_at: None,
        };

        match self.store.insert(&record).await {
            Ok(()) => info!(
                failed_job = %uuid,
                connection = %connection,
                queue = %queue,
                job_class = %record.job_class,
                exception = %record.exception_class,
                retryable = record.retryable,
                "Logged failed job"
            ),
            Err(e) => error!(
                failed_job = %uuid,
                connection = %connection,
                queue = %queue,
                error = %e,
                "Failed to persist failed job record"
            ),
        }

        uuid
    }

    /// Requeues a failed job. Returns false if the record is missing, not
    /// retryable, over the retry limit, or its payload cannot be requeued.
    pub async fn retry(&self, uuid: &str) -> bool {
        let requeued = match self.try_retry(uuid).await {
            Ok(requeued) => requeued,
            Err(e) => {
                warn!(failed_job = %uuid, error = %e, "Failed job retry aborted");
                false
            }
        };
        FailedJobMetrics::retried(requeued);
        requeued
    }

    async fn try_retry(&self, uuid: &str) -> JobResult<bool> {
        let Some(record) = self.store.find(uuid).await? else {
            debug!(failed_job = %uuid, "Failed job not found");
            return Ok(false);
        };

        if !record.retryable {
            debug!(failed_job = %uuid, "Failed job is not retryable");
            return Ok(false);
        }
        if record.retry_count >= self.max_retries {
            debug!(
                failed_job = %uuid,
                retry_count = record.retry_count,
                max_retries = self.max_retries,
                "Failed job reached retry limit"
            );
            return Ok(false);
        }

        let payload = self.codec.decode(&record.payload)?;
        let queue = if record.queue.is_empty() {
            payload.queue.clone()
        } else {
            record.queue.clone()
        };
        let mut job = NewJob::new(payload.job_class, payload.data)
            .on_queue(queue)
            .max_attempts(payload.max_attempts.max(1))
            .timeout_seconds(payload.timeout_seconds.max(1))
            .priority(payload.priority);
        if let Some(batch) = payload.batch_uuid {
            job = job.batch(batch);
        }
        job.validate()?;

        let driver = self.resolver.resolve(&record.connection).await?;

        if !self.store.mark_retried(uuid, self.max_retries, self.clock.now()).await? {
            return Ok(false);
        }

        let job_id = match driver.enqueue(job).await {
            Ok(job_id) => job_id,
            Err(e) => {
                self.store.revert_retried(uuid, record.last_retry_at).await?;
                return Err(e);
            }
        };
        self.store.mark_requeued(uuid, self.clock.now()).await?;

        info!(
            failed_job = %uuid,
            job_id = %job_id,
            connection = %record.connection,
            queue = %record.queue,
            "Requeued failed job"
        );
        Ok(true)
    }

    /// Retries every retryable, under-limit record matching `filters`.
    /// Each record is retried independently.
    pub async fn retry_all(&self, filters: &FailedJobFilters) -> BTreeMap<String, bool> {
        let filters = FailedJobFilters {
            retryable: Some(true),
            ..filters.clone()
        };

        let records = match self.store.list(&filters, None, 0).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to list failed jobs for retry");
                return BTreeMap::new();
            }
        };

        let mut results = BTreeMap::new();
        for record in records.into_iter().filter(|r| r.retry_count < self.max_retries) {
            let requeued = self.retry(&record.uuid).await;
            results.insert(record.uuid, requeued);
        }

        info!(
            selected = results.len(),
            requeued = results.values().filter(|r| **r).count(),
            "Retried failed jobs"
        );
        results
    }

    /// Deletes records older than `days_old` (default: the configured
    /// retention). Returns false if the store rejected the deletion.
    pub async fn cleanup(&self, days_old: Option<u32>) -> bool {
        let days = days_old.unwrap_or(self.retention_days);
        let cutoff = self.clock.now() - ChronoDuration::days(i64::from(days));
        match self.store.delete_older_than(cutoff).await {
            Ok(removed) => {
                info!(days, removed, "Cleaned up failed jobs");
                true
            }
            Err(e) => {
                error!(days, error = %e, "Failed job cleanup failed");
                false
            }
        }
    }

    /// Totals by classification and failures in the last 24 hours.
    pub async fn stats(&self, filters: &FailedJobFilters) -> JobResult<FailedJobStats> {
        let since = self.clock.now() - ChronoDuration::hours(24);
        self.store.stats(filters, since).await
    }

    /// Top exception and job classes plus hourly counts over the last week.
    pub async fn failure_patterns(&self) -> JobResult<FailurePatterns> {
        let since = self.clock.now() - ChronoDuration::days(PATTERN_WINDOW_DAYS);
        self.store.patterns(TOP_PATTERNS, since).await
    }

    pub async fn find(&self, uuid: &str) -> JobResult<Option<FailedJobRecord>> {
        self.store.find(uuid).await
    }

    pub async fn list(
        &self,
        filters: &FailedJobFilters,
        limit: Option<u64>,
        offset: u64,
    ) -> JobResult<Vec<FailedJobRecord>> {
        self.store.list(filters, limit, offset).await
    }

    pub async fn count(&self, filters: &FailedJobFilters) -> JobResult<u64> {
        self.store.count(filters).await
    }

    /// Deletes one record.
    pub async fn forget(&self, uuid: &str) -> JobResult<bool> {
        let removed = self.store.delete(uuid).await?;
        if removed {
            info!(failed_job = %uuid, "Forgot failed job");
        }
        Ok(removed)
    }

    /// Deletes every record.
    pub async fn flush(&self) -> JobResult<u64> {
        let removed = self.store.flush().await?;
        warn!(removed, "Flushed all failed jobs");
        Ok(removed)
    }

    /// Dumps matching records.
    pub async fn export(&self, filters: &FailedJobFilters, format: ExportFormat) -> JobResult<String> {
        let records = self.store.list(filters, None, 0).await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&records)?),
            ExportFormat::Csv => to_csv(&records),
        }
    }
}

#[async_trait]
impl FailedJobLogger for FailedJobProvider {
    async fn log(&self, connection: &str, queue: &str, payload: &str, failure: &JobFailure) -> String {
        FailedJobProvider::log(self, connection, queue, payload, failure).await
    }
}

fn to_csv(records: &[FailedJobRecord]) -> JobResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER).map_err(csv_error)?;
    for r in records {
        let failed_at = r.failed_at.to_rfc3339();
        let attempts = r.attempts.to_string();
        let retry_count = r.retry_count.to_string();
        let retryable = r.retryable.to_string();
        let last_retry_at = r.last_retry_at.map(|t| t.to_rfc3339()).unwrap_or_default();
        writer
            .write_record([
                r.uuid.as_str(),
                r.connection.as_str(),
                r.queue.as_str(),
                r.job_class.as_str(),
                r.job_uuid.as_deref().unwrap_or_default(),
                r.exception_class.as_str(),
                r.exception_message.as_str(),
                failed_at.as_str(),
                attempts.as_str(),
                retry_count.as_str(),
                retryable.as_str(),
                last_retry_at.as_str(),
            ])
            .map_err(csv_error)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| JobError::Internal(format!("CSV export failed: {}", e.error())))?;
    String::from_utf8(bytes).map_err(|e| JobError::Internal(format!("CSV export failed: {e}")))
}

fn csv_error(e: csv::Error) -> JobError {
    JobError::Internal(format!("CSV export failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::driver::{
        ConfigSchema, DriverConfig, DriverContext, HealthStatus, MemoryDriver, QueueDriver, RegisteredDriver,
    };
    use crate::failed::MemoryFailedJobStore;
    use crate::job::{Job, JobId};
    use chrono::Utc;
    use serde_json::json;

    struct FixedResolver(Arc<dyn QueueDriver>);

    #[async_trait]
    impl QueueResolver for FixedResolver {
        async fn resolve(&self, _connection: &str) -> JobResult<Arc<dyn QueueDriver>> {
            Ok(Arc::clone(&self.0))
        }
    }

    /// A driver whose backend rejects every push.
    struct DownDriver;

    #[async_trait]
    impl QueueDriver for DownDriver {
        fn name(&self) -> &str {
            "down"
        }

        async fn initialize(&mut self, _config: &DriverConfig) -> JobResult<()> {
            Ok(())
        }

        async fn enqueue(&self, _job: NewJob) -> JobResult<JobId> {
            Err(JobError::Queue("connection refused".into()))
        }

        async fn pop(&self, _queue: Option<&str>) -> JobResult<Option<Job>> {
            Ok(None)
        }

        async fn release(&self, _job: &Job, _delay: std::time::Duration) -> JobResult<()> {
            Ok(())
        }

        async fn delete(&self, _job: &Job) -> JobResult<()> {
            Ok(())
        }

        async fn size(&self, _queue: Option<&str>) -> JobResult<u64> {
            Ok(0)
        }

        async fn purge(&self, _queue: Option<&str>) -> JobResult<u64> {
            Ok(0)
        }

        async fn stats(&self, _queue: Option<&str>) -> JobResult<crate::driver::DriverStats> {
            Ok(crate::driver::DriverStats::new())
        }

        async fn failed(&self, _job: &Job, _failure: &JobFailure) -> JobResult<()> {
            Ok(())
        }

        async fn health_check(&self) -> HealthStatus {
            HealthStatus::unhealthy("connection refused")
        }

        fn features(&self) -> Vec<String> {
            Vec::new()
        }

        fn config_schema(&self) -> ConfigSchema {
            ConfigSchema::new()
        }
    }

    struct DownResolver;

    #[async_trait]
    impl QueueResolver for DownResolver {
        async fn resolve(&self, _connection: &str) -> JobResult<Arc<dyn QueueDriver>> {
            Ok(Arc::new(DownDriver))
        }
    }

    struct Fixture {
        provider: FailedJobProvider,
        driver: Arc<dyn QueueDriver>,
        store: Arc<MemoryFailedJobStore>,
        clock: ManualClock,
    }

    async fn fixture(config: FailedJobsConfig) -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let shared: SharedClock = Arc::new(clock.clone());
        let mut driver = MemoryDriver::create(DriverContext::new(Arc::clone(&shared)));
        driver.initialize(&DriverConfig::new()).await.unwrap();
        let driver: Arc<dyn QueueDriver> = Arc::new(driver);
        let store = Arc::new(MemoryFailedJobStore::new());
        let provider = FailedJobProvider::new(
            store.clone(),
            Arc::new(FixedResolver(Arc::clone(&driver))),
            &config,
            shared,
        );
        Fixture {
            provider,
            driver,
            store,
            clock,
        }
    }

    fn payload(job_class: &str) -> String {
        let job = NewJob::new(job_class, json!({"id": 7})).into_job("default", Utc::now());
        PayloadCodec::default().encode(&job).unwrap()
    }

    #[tokio::test]
    async fn test_log_classifies_and_parses_payload() {
        let f = fixture(FailedJobsConfig::default()).await;
        let uuid = f
            .provider
            .log("memory", "default", &payload("SendEmail"), &JobFailure::permanent("TypeError", "bad"))
            .await;

        let record = f.provider.find(&uuid).await.unwrap().unwrap();
        assert!(!record.retryable);
        assert_eq!(record.job_class, "SendEmail");
        assert_eq!(record.retry_count, 0);
        assert!(record.job_uuid.is_some());
    }

    #[tokio::test]
    async fn test_log_tolerates_unreadable_payload() {
        let f = fixture(FailedJobsConfig::default()).await;
        let uuid = f
            .provider
            .log("memory", "default", "not json", &JobFailure::transient("IOError", "x"))
            .await;
        let record = f.provider.find(&uuid).await.unwrap().unwrap();
        assert_eq!(record.job_class, UNKNOWN_JOB_CLASS);
    }

    #[tokio::test]
    async fn test_retry_requeues_and_counts() {
        let f = fixture(FailedJobsConfig::default()).await;
        let uuid = f
            .provider
            .log("memory", "mail", &payload("SendEmail"), &JobFailure::transient("IOError", "x"))
            .await;

        assert!(f.provider.retry(&uuid).await);

        let record = f.provider.find(&uuid).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_retry_at, Some(f.clock.now()));
        assert!(record.requeued_at.is_some());

        let job: Job = f.driver.pop(Some("mail")).await.unwrap().unwrap();
        assert_eq!(job.job_class, "SendEmail");
        assert_eq!(job.attempts, 0);
        assert_eq!(job.data["id"], 7);
    }

    #[tokio::test]
    async fn test_retry_rejections() {
        let f = fixture(FailedJobsConfig::default()).await;
        assert!(!f.provider.retry("missing").await);

        let permanent = f
            .provider
            .log("memory", "default", &payload("A"), &JobFailure::permanent("TypeError", "x"))
            .await;
        assert!(!f.provider.retry(&permanent).await);

        let corrupt = f
            .provider
            .log("memory", "default", "garbage", &JobFailure::transient("IOError", "x"))
            .await;
        assert!(!f.provider.retry(&corrupt).await);
        assert_eq!(f.store.find(&corrupt).await.unwrap().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_unqueueable_payload_keeps_retry_budget() {
        let f = fixture(FailedJobsConfig::default()).await;
        let mut envelope: serde_json::Value = serde_json::from_str(&payload("SendEmail")).unwrap();
        envelope["data"] = json!("not-an-object");
        let uuid = f
            .provider
            .log("memory", "default", &envelope.to_string(), &JobFailure::transient("IOError", "x"))
            .await;

        assert!(!f.provider.retry(&uuid).await);

        let record = f.provider.find(&uuid).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.last_retry_at, None);
        assert_eq!(record.requeued_at, None);
        assert_eq!(f.driver.size(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_enqueue_restores_retry_slot() {
        let f = fixture(FailedJobsConfig::default()).await;
        let uuid = f
            .provider
            .log("memory", "default", &payload("SendEmail"), &JobFailure::transient("IOError", "x"))
            .await;
        f.store.mark_retried(&uuid, 5, f.clock.now()).await.unwrap();
        let stamped = f.provider.find(&uuid).await.unwrap().unwrap().last_retry_at;

        let provider = FailedJobProvider::new(
            f.store.clone(),
            Arc::new(DownResolver),
            &FailedJobsConfig::default(),
            Arc::new(f.clock.clone()),
        );
        assert!(!provider.retry(&uuid).await);

        let record = f.provider.find(&uuid).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_retry_at, stamped);
        assert_eq!(record.requeued_at, None);
    }

    #[tokio::test]
    async fn test_retry_respects_allow_list() {
        let config = FailedJobsConfig {
            payload_allow_list: vec!["SendEmail".to_string()],
            ..FailedJobsConfig::default()
        };
        let f = fixture(config).await;
        let uuid = f
            .provider
            .log("memory", "default", &payload("DropTables"), &JobFailure::transient("E", "x"))
            .await;
        assert!(!f.provider.retry(&uuid).await);
    }

    #[tokio::test]
    async fn test_retry_all_is_independent_per_record() {
        let f = fixture(FailedJobsConfig::default()).await;
        let good = f
            .provider
            .log("memory", "default", &payload("A"), &JobFailure::transient("E", "x"))
            .await;
        let bad = f
            .provider
            .log("memory", "default", "garbage", &JobFailure::transient("E", "x"))
            .await;
        let permanent = f
            .provider
            .log("memory", "default", &payload("B"), &JobFailure::permanent("TypeError", "x"))
            .await;

        let results = f.provider.retry_all(&FailedJobFilters::new()).await;
        assert_eq!(results.get(&good), Some(&true));
        assert_eq!(results.get(&bad), Some(&false));
        assert!(!results.contains_key(&permanent));
    }

    #[tokio::test]
    async fn test_cleanup_uses_retention() {
        let f = fixture(FailedJobsConfig::default()).await;
        let old = f
            .provider
            .log("memory", "default", &payload("A"), &JobFailure::transient("E", "x"))
            .await;
        f.clock.advance(std::time::Duration::from_secs(31 * 86_400));
        let fresh = f
            .provider
            .log("memory", "default", &payload("A"), &JobFailure::transient("E", "x"))
            .await;

        assert!(f.provider.cleanup(None).await);
        assert!(f.provider.find(&old).await.unwrap().is_none());
        assert!(f.provider.find(&fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats() {
        let f = fixture(FailedJobsConfig::default()).await;
        f.provider
            .log("memory", "default", &payload("A"), &JobFailure::transient("E", "x"))
            .await;
        f.provider
            .log("memory", "default", &payload("A"), &JobFailure::permanent("TypeError", "x"))
            .await;

        let stats = f.provider.stats(&FailedJobFilters::new()).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.retryable, 1);
        assert_eq!(stats.non_retryable, 1);
        assert_eq!(stats.last_24h, 2);
    }

    #[tokio::test]
    async fn test_export_csv_escapes_fields() {
        let f = fixture(FailedJobsConfig::default()).await;
        f.provider
            .log(
                "memory",
                "default",
                &payload("A"),
                &JobFailure::transient("E", "said \"no\", twice"),
            )
            .await;

        let csv = f.provider.export(&FailedJobFilters::new(), ExportFormat::Csv).await.unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap(), CSV_HEADER.join(","));
        assert!(lines.next().unwrap().contains("\"said \"\"no\"\", twice\""));

        let json = f.provider.export(&FailedJobFilters::new(), ExportFormat::Json).await.unwrap();
        let parsed: Vec<FailedJobRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[tokio::test]
    async fn test_export_csv_reads_back_multiline_messages() {
        let f = fixture(FailedJobsConfig::default()).await;
        let uuid = f
            .provider
            .log(
                "memory",
                "default",
                &payload("A"),
                &JobFailure::transient("E", "line one\nline two, \"quoted\""),
            )
            .await;

        let csv = f.provider.export(&FailedJobFilters::new(), ExportFormat::Csv).await.unwrap();
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), CSV_HEADER.to_vec());

        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], uuid.as_str());
        assert_eq!(&rows[0][6], "line one\nline two, \"quoted\"");
        assert_eq!(&rows[0][11], "");
    }

    #[test]
    fn test_export_format_parse() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
