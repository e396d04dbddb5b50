//! Failed-job tracking.
//!
//! Every terminal job failure becomes a [`FailedJobRecord`]. The
//! [`FailedJobProvider`] owns retry orchestration and failure analytics and
//! delegates persistence to a [`FailedJobStore`].

mod memory;
mod mysql;
mod provider;

pub use memory::MemoryFailedJobStore;
pub use mysql::{MySqlFailedJobStore, MySqlFailedJobStoreParameters};
pub use provider::{ExportFormat, FailedJobProvider};

use crate::driver::QueueDriver;
use crate::error::JobResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shaku::Interface;
use std::sync::Arc;

/// Persisted record of a terminal job failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJobRecord {
    pub uuid: String,
    pub connection: String,
    pub queue: String,
    /// Serialized job envelope as handed over by the driver.
    pub payload: String,
    pub exception_class: String,
    pub exception_message: String,
    pub exception_trace: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Classification computed once, when the failure was logged.
    pub retryable: bool,
    pub job_class: String,
    pub job_uuid: Option<String>,
    pub attempts: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub requeued_at: Option<DateTime<Utc>>,
}

/// Selection criteria shared by listing, counting, stats and export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJobFilters {
    pub connection: Option<String>,
    pub queue: Option<String>,
    pub job_class: Option<String>,
    pub exception_class: Option<String>,
    pub retryable: Option<bool>,
    pub failed_after: Option<DateTime<Utc>>,
    pub failed_before: Option<DateTime<Utc>>,
}

impl FailedJobFilters {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    #[must_use]
    pub fn job_class(mut self, job_class: impl Into<String>) -> Self {
        self.job_class = Some(job_class.into());
        self
    }

    #[must_use]
    pub fn exception_class(mut self, exception_class: impl Into<String>) -> Self {
        self.exception_class = Some(exception_class.into());
        self
    }

    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    #[must_use]
    pub fn failed_after(mut self, at: DateTime<Utc>) -> Self {
        self.failed_after = Some(at);
        self
    }

    #[must_use]
    pub fn failed_before(mut self, at: DateTime<Utc>) -> Self {
        self.failed_before = Some(at);
        self
    }

    /// Returns true if the record satisfies every set criterion.
    pub fn matches(&self, record: &FailedJobRecord) -> bool {
        fn eq(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().map_or(true, |f| f == value)
        }

        eq(&self.connection, &record.connection)
            && eq(&self.queue, &record.queue)
            && eq(&self.job_class, &record.job_class)
            && eq(&self.exception_class, &record.exception_class)
            && self.retryable.map_or(true, |r| r == record.retryable)
            && self.failed_after.map_or(true, |t| record.failed_at >= t)
            && self.failed_before.map_or(true, |t| record.failed_at <= t)
    }
}

/// Aggregate counts over failure records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJobStats {
    pub total: u64,
    pub retryable: u64,
    pub non_retryable: u64,
    pub last_24h: u64,
}

/// A grouped frequency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternCount {
    pub name: String,
    pub count: u64,
}

/// Failures within one clock hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyCount {
    pub hour: DateTime<Utc>,
    pub count: u64,
}

/// Failure analytics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePatterns {
    /// Most frequent exception classes, most frequent first.
    pub exception_types: Vec<PatternCount>,
    /// Most frequent job classes, most frequent first.
    pub job_classes: Vec<PatternCount>,
    /// Per-hour counts, oldest hour first.
    pub hourly: Vec<HourlyCount>,
}

/// Persistence for failure records.
///
/// Implementations must make `mark_retried` a single conditional update so
/// concurrent retries of one record never exceed the limit.
#[async_trait]
pub trait FailedJobStore: Interface + Send + Sync {
    async fn insert(&self, record: &FailedJobRecord) -> JobResult<()>;

    async fn find(&self, uuid: &str) -> JobResult<Option<FailedJobRecord>>;

    /// Records matching `filters`, newest first.
    async fn list(
        &self,
        filters: &FailedJobFilters,
        limit: Option<u64>,
        offset: u64,
    ) -> JobResult<Vec<FailedJobRecord>>;

    async fn count(&self, filters: &FailedJobFilters) -> JobResult<u64>;

    /// Returns true if a record was removed.
    async fn delete(&self, uuid: &str) -> JobResult<bool>;

    /// Removes every record.
    async fn flush(&self) -> JobResult<u64>;

    /// Increments `retry_count` and stamps `last_retry_at` only while
    /// `retry_count < max_retries`. Returns true if the record was updated.
    async fn mark_retried(&self, uuid: &str, max_retries: u32, at: DateTime<Utc>) -> JobResult<bool>;

    /// Undoes a `mark_retried` whose requeue failed: decrements
    /// `retry_count` and restores the previous `last_retry_at`.
    async fn revert_retried(&self, uuid: &str, previous_retry_at: Option<DateTime<Utc>>) -> JobResult<()>;

    /// Stamps `requeued_at` once the job is back on its queue.
    async fn mark_requeued(&self, uuid: &str, at: DateTime<Utc>) -> JobResult<()>;

    /// Removes records that failed before `cutoff`.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> JobResult<u64>;

    /// Counts by classification plus failures since `recent_since`.
    async fn stats(&self, filters: &FailedJobFilters, recent_since: DateTime<Utc>) -> JobResult<FailedJobStats>;

    /// Grouped frequencies. Hourly buckets cover failures since
    /// `hourly_since`.
    async fn patterns(&self, top: usize, hourly_since: DateTime<Utc>) -> JobResult<FailurePatterns>;
}

/// Maps a connection name to the driver that serves it.
#[async_trait]
pub trait QueueResolver: Send + Sync {
    async fn resolve(&self, connection: &str) -> JobResult<Arc<dyn QueueDriver>>;
}

/// Truncates a timestamp to the start of its hour.
pub(crate) fn hour_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or(at)
}
