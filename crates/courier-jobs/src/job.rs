//! Job definitions and lifecycle states.

use crate::failure::JobFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Default maximum attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default execution timeout for a job, in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Queue used when none is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Stored in the driver, not claimed.
    Pending,
    /// Popped by a worker and invisible to others.
    Reserved,
    /// Finished successfully and deleted.
    Completed,
    /// Returned to the queue without consuming an attempt.
    Released,
    /// Failed with attempts left; released with a backoff delay.
    Retrying,
    /// Terminal failure recorded with the failed-job provider.
    Failed,
}

impl JobState {
    /// Returns true if no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::{Completed, Failed, Pending, Released, Reserved, Retrying};
        match self {
            Pending => next == Reserved,
            Reserved => matches!(next, Completed | Released | Retrying | Failed),
            Released | Retrying => matches!(next, Pending | Reserved),
            Completed | Failed => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Reserved => "reserved",
            JobState::Completed => "completed",
            JobState::Released => "released",
            JobState::Retrying => "retrying",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A unit of queued work as seen by a worker.
///
/// The driver owns the stored state. A `Job` returned from `pop` is a
/// snapshot that the worker mutates (attempt counter) and hands back on
/// `release`, `delete` or `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID.
    pub id: JobId,

    /// Queue name.
    pub queue: String,

    /// Handler name used to dispatch the job.
    pub job_class: String,

    /// Job payload.
    pub data: Value,

    /// Attempts made so far.
    pub attempts: u32,

    /// Maximum attempts.
    pub max_attempts: u32,

    /// Hard execution cap in seconds.
    pub timeout_seconds: u64,

    /// Priority (higher = served first).
    pub priority: i32,

    /// Optional grouping key.
    pub batch_uuid: Option<String>,

    /// When the job was pushed.
    pub created_at: DateTime<Utc>,

    /// When the job becomes visible to `pop`.
    pub available_at: DateTime<Utc>,

    /// When the job was reserved, if it is.
    pub reserved_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Returns the execution timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Records an execution attempt.
    pub fn mark_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Returns true if attempts remain.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns true if the job should be released for another attempt.
    ///
    /// A permanent failure stops retries even when attempts remain.
    pub fn should_retry(&self, failure: &JobFailure) -> bool {
        self.has_attempts_left() && failure.is_retryable()
    }
}
