//! Courier Jobs - Driver-Abstracted Job Queue
//!
//! Background job processing behind a pluggable driver contract:
//! - Queue drivers for memory, MySQL tables and Redis, selected by name
//! - A driver registry that validates configuration against each driver's
//!   schema and caches initialized instances
//! - Workers with per-job timeouts, retry backoff and permanent-failure
//!   detection
//! - Failed-job tracking with retry, statistics, pattern analysis and export
//! - A cron scheduler with persistent schedules and execution history
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         QueueContext                           │
//! │                                                                │
//! │  Producer ──push──▶ ┌──────────────────┐                       │
//! │                     │  DriverRegistry  │◀──── JobsConfig       │
//! │                     │ memory│db│redis  │                       │
//! │                     └────────┬─────────┘                       │
//! │                        pop   │   release / delete              │
//! │                              ▼                                 │
//! │                     ┌──────────────────┐                       │
//! │                     │    WorkerPool    │──▶ HandlerRegistry    │
//! │                     └────────┬─────────┘                       │
//! │                      failed  │                                 │
//! │                              ▼                                 │
//! │                     ┌──────────────────┐                       │
//! │                     │FailedJobProvider │──retry──▶ registry    │
//! │                     └──────────────────┘                       │
//! │                                                                │
//! │  JobScheduler ──cron──▶ TaskRegistry ──▶ JobExecution rows     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_jobs::{JobsConfig, NewJob, QueueContext};
//! use serde_json::json;
//!
//! let ctx = QueueContext::in_memory(JobsConfig::default());
//! ctx.handlers().register_fn("SendEmail", |job| async move {
//!     println!("sending to {}", job.data["to"]);
//!     Ok(())
//! });
//!
//! ctx.dispatch(NewJob::new("SendEmail", json!({"to": "user@example.com"})), Some("memory")).await?;
//! ctx.worker(Some("memory")).await?.process_next().await?;
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod driver;
pub mod error;
pub mod failed;
pub mod failure;
pub mod job;
pub mod metrics;
pub mod payload;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConnectionConfig, FailedJobsConfig, JobsConfig, RetryConfig, SchedulerConfig, WorkerConfig};
pub use context::{build_mysql_store_module, MemoryStoreModule, MySqlStoreModule, QueueContext, QueueStores};
pub use driver::{
    BulkPushResult, DriverConfig, DriverContext, DriverInfo, FailedJobLogger, HealthState, HealthStatus, NewJob,
    QueueDriver, RegisteredDriver,
};
pub use error::{JobError, JobResult};
pub use failed::{ExportFormat, FailedJobFilters, FailedJobProvider, FailedJobRecord, FailedJobStats, FailurePatterns};
pub use failure::{FailureKind, JobFailure};
pub use job::{Job, JobId, JobState};
pub use metrics::{register_metrics, DriverMetrics, FailedJobMetrics, JobMetrics, SchedulerMetrics, WorkerMetrics};
pub use payload::{JobPayload, PayloadCodec};
pub use registry::{ConnectionResolver, DriverDescriptor, DriverRegistry, PluginManager};
pub use retry::{RetryPolicy, RetryStrategy};
pub use scheduler::{CronExpression, ExecutionReport, ExecutionStatus, JobExecution, JobScheduler, ScheduledJob};
pub use worker::{HandlerRegistry, JobHandler, ProcessOutcome, Worker, WorkerPool};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::driver::{NewJob, QueueDriver};
    pub use crate::failure::JobFailure;
    pub use crate::job::Job;
    pub use crate::worker::JobHandler;
    pub use crate::{JobError, JobResult};
}
