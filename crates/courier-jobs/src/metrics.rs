//! Queue metrics.
//!
//! Recorded through the `metrics` facade; whichever exporter the binary
//! installs receives them.

use crate::driver::{HealthState, HealthStatus};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Jobs pushed onto a queue.
    pub const JOBS_PUSHED_TOTAL: &str = "courier_jobs_pushed_total";
    /// Jobs claimed by a worker.
    pub const JOBS_POPPED_TOTAL: &str = "courier_jobs_popped_total";
    /// Jobs that completed and were deleted.
    pub const JOBS_COMPLETED_TOTAL: &str = "courier_jobs_completed_total";
    /// Jobs released back to their queue for another attempt.
    pub const JOBS_RELEASED_TOTAL: &str = "courier_jobs_released_total";
    /// Jobs that failed terminally.
    pub const JOBS_FAILED_TOTAL: &str = "courier_jobs_failed_total";
    /// Jobs that exceeded their timeout.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "courier_jobs_timed_out_total";
    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "courier_job_duration_seconds";

    /// Failed-job retry attempts.
    pub const FAILED_JOB_RETRIES_TOTAL: &str = "courier_failed_job_retries_total";

    /// Scheduled task executions.
    pub const SCHEDULER_EXECUTIONS_TOTAL: &str = "courier_scheduler_executions_total";

    /// Driver health (1 operational, 0 otherwise).
    pub const DRIVER_HEALTHY: &str = "courier_driver_healthy";
    /// Driver health probe latency in seconds.
    pub const DRIVER_HEALTH_RESPONSE_SECONDS: &str = "courier_driver_health_response_seconds";

    /// Workers currently processing a job.
    pub const WORKERS_ACTIVE: &str = "courier_workers_active";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_PUSHED_TOTAL, "Total number of jobs pushed");
    describe_counter!(names::JOBS_POPPED_TOTAL, "Total number of jobs claimed by workers");
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of jobs completed successfully");
    describe_counter!(names::JOBS_RELEASED_TOTAL, "Total number of jobs released for retry");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed terminally");
    describe_counter!(names::JOBS_TIMED_OUT_TOTAL, "Total number of jobs that timed out");
    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");

    describe_counter!(
        names::FAILED_JOB_RETRIES_TOTAL,
        "Total number of failed-job retry attempts"
    );

    describe_counter!(
        names::SCHEDULER_EXECUTIONS_TOTAL,
        "Total number of scheduled task executions"
    );

    describe_gauge!(
        names::DRIVER_HEALTHY,
        "Whether the driver reported itself operational (1) or not (0)"
    );
    describe_histogram!(
        names::DRIVER_HEALTH_RESPONSE_SECONDS,
        "Driver health probe latency in seconds"
    );

    describe_gauge!(names::WORKERS_ACTIVE, "Number of workers processing a job");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    pub fn job_pushed(queue: &str, job_class: &str) {
        counter!(
            names::JOBS_PUSHED_TOTAL,
            "queue" => queue.to_string(),
            "job_class" => job_class.to_string()
        )
        .increment(1);
    }

    pub fn job_popped(queue: &str, job_class: &str) {
        counter!(
            names::JOBS_POPPED_TOTAL,
            "queue" => queue.to_string(),
            "job_class" => job_class.to_string()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, job_class: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "job_class" => job_class.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_class" => job_class.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_released(queue: &str, job_class: &str, attempt: u32) {
        counter!(
            names::JOBS_RELEASED_TOTAL,
            "queue" => queue.to_string(),
            "job_class" => job_class.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a terminal failure.
    pub fn job_failed(queue: &str, job_class: &str, failure_class: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "job_class" => job_class.to_string(),
            "failure_class" => failure_class.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_class" => job_class.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_timed_out(queue: &str, job_class: &str) {
        counter!(
            names::JOBS_TIMED_OUT_TOTAL,
            "queue" => queue.to_string(),
            "job_class" => job_class.to_string()
        )
        .increment(1);
    }
}

/// Failed-job metrics recorder.
#[derive(Clone)]
pub struct FailedJobMetrics;

impl FailedJobMetrics {
    pub fn retried(success: bool) {
        counter!(
            names::FAILED_JOB_RETRIES_TOTAL,
            "result" => if success { "requeued" } else { "rejected" }
        )
        .increment(1);
    }
}

/// Scheduler metrics recorder.
#[derive(Clone)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    pub fn execution(task: &str, status: &str) {
        counter!(
            names::SCHEDULER_EXECUTIONS_TOTAL,
            "task" => task.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }
}

/// Driver metrics recorder.
#[derive(Clone)]
pub struct DriverMetrics;

impl DriverMetrics {
    /// Record the outcome of a health probe.
    pub fn record_health(driver: &str, status: &HealthStatus) {
        let healthy = if status.is_operational() { 1.0 } else { 0.0 };
        gauge!(names::DRIVER_HEALTHY, "driver" => driver.to_string()).set(healthy);

        if let Some(ms) = status.response_time_ms {
            histogram!(
                names::DRIVER_HEALTH_RESPONSE_SECONDS,
                "driver" => driver.to_string(),
                "status" => health_label(status.status)
            )
            .record(ms / 1000.0);
        }
    }
}

fn health_label(state: HealthState) -> &'static str {
    match state {
        HealthState::Healthy => "healthy",
        HealthState::Degraded => "degraded",
        HealthState::Unhealthy => "unhealthy",
        HealthState::Unknown => "unknown",
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn set_active(active: usize) {
        gauge!(names::WORKERS_ACTIVE).set(active as f64);
    }
}
