//! Recurring task scheduler.
//!
//! Tasks registered in process run alongside persistent jobs loaded from a
//! [`ScheduleStore`]. Every persistent run is recorded as a [`JobExecution`]
//! and moves the job's `next_run` forward from its new `last_run`.

mod cron;
mod lease;
mod mysql;
mod runner;
mod store;
mod task;

pub use self::cron::CronExpression;
pub use self::lease::{LeaseLock, LeaseToken, MemoryLeaseLock, RedisLeaseLock};
pub use self::mysql::{MySqlScheduleStore, MySqlScheduleStoreParameters};
pub use self::runner::{ExecutionReport, JobScheduler};
pub use self::store::{ExecutionStatus, JobExecution, MemoryScheduleStore, ScheduleStore, ScheduledJob};
pub use self::task::{FnTask, ScheduledTask, TaskRegistry};
