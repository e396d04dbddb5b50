//! Job error types.

use crate::job::JobId;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Queue-related errors.
///
/// These describe failures of the queue machinery itself. Failures raised by
/// job code while it runs are [`crate::JobFailure`] values instead.
#[derive(Debug, Error)]
pub enum JobError {
    /// Requested driver name is not registered.
    #[error("Queue driver not found: {0}")]
    DriverNotFound(String),

    /// Driver configuration failed schema validation.
    #[error("Invalid configuration for driver '{driver}': {}", .errors.join("; "))]
    InvalidConfiguration { driver: String, errors: Vec<String> },

    /// Generic backend operation failure.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Scheduler error.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Job payload could not be accepted or decoded.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Some entries of a bulk push failed.
    ///
    /// `ids` is aligned with the input; failed positions are `None`.
    #[error("Bulk push failed for {} of {} jobs (indices {failed:?})", .failed.len(), .ids.len())]
    BulkPartialFailure {
        ids: Vec<Option<JobId>>,
        failed: Vec<usize>,
    },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true for backend connectivity failures.
    ///
    /// Workers log these and back off before polling again.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            JobError::Queue(_)
                | JobError::Database(_)
                | JobError::Redis(_)
                | JobError::Pool(_)
                | JobError::Timeout(_)
        )
    }

    /// Builds an invalid-configuration error.
    pub fn invalid_configuration(driver: impl Into<String>, errors: Vec<String>) -> Self {
        JobError::InvalidConfiguration {
            driver: driver.into(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_errors() {
        assert!(JobError::Queue("down".into()).is_infrastructure());
        assert!(JobError::Timeout(5).is_infrastructure());
        assert!(JobError::Database(sqlx::Error::PoolTimedOut).is_infrastructure());
    }

    #[test]
    fn test_logic_errors_are_not_infrastructure() {
        assert!(!JobError::DriverNotFound("x".into()).is_infrastructure());
        assert!(!JobError::InvalidPayload("bad".into()).is_infrastructure());
        assert!(!JobError::invalid_configuration("redis", vec![]).is_infrastructure());
    }

    #[test]
    fn test_invalid_configuration_lists_every_error() {
        let err = JobError::invalid_configuration(
            "database",
            vec!["host is required".into(), "port is required".into()],
        );
        let msg = err.to_string();
        assert!(msg.contains("database"));
        assert!(msg.contains("host is required; port is required"));
    }

    #[test]
    fn test_bulk_partial_failure_display() {
        let err = JobError::BulkPartialFailure {
            ids: vec![Some(JobId::new()), None, Some(JobId::new())],
            failed: vec![1],
        };
        let msg = err.to_string();
        assert!(msg.contains("1 of 3"));
        assert!(msg.contains("[1]"));
    }

    #[test]
    fn test_error_display_timeout() {
        assert!(JobError::Timeout(60).to_string().contains("60"));
    }
}
