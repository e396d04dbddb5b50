//! Courier command line: workers, the cron scheduler and failed-job
//! administration on top of `courier-jobs`.

pub mod app;
pub mod builtin;
pub mod cli;
