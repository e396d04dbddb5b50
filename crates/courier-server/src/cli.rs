//! Command line definition.

use clap::{Args, Parser, Subcommand};
use courier_jobs::{ExportFormat, FailedJobFilters};

/// Courier job queue worker and administration tool
#[derive(Debug, Parser)]
#[command(name = "courier", about, version)]
pub struct Cli {
    /// Directory holding `default.toml` and environment overlays
    #[arg(long, env = "COURIER_CONFIG_DIR", default_value = "./config")]
    pub config_dir: String,

    /// Keep failure records and schedules in memory instead of MySQL
    #[arg(long)]
    pub in_memory: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Process jobs until interrupted
    Work(WorkArgs),

    /// Manage scheduled tasks
    #[command(subcommand)]
    Schedule(ScheduleCommand),

    /// Inspect and retry failed jobs
    #[command(subcommand)]
    Failed(FailedCommand),

    /// Inspect queue drivers
    #[command(subcommand)]
    Drivers(DriversCommand),

    /// Create the queue tables
    Migrate,
}

impl Command {
    /// Commands that keep running until interrupted.
    pub fn is_long_running(&self) -> bool {
        match self {
            Self::Work(args) => !args.once,
            Self::Schedule(cmd) => matches!(cmd, ScheduleCommand::Work),
            _ => false,
        }
    }
}

#[derive(Debug, Args)]
pub struct WorkArgs {
    /// Connection to pop from (defaults to `jobs.default_driver`)
    #[arg(long)]
    pub connection: Option<String>,

    /// Queues to poll, in order
    #[arg(long, value_delimiter = ',')]
    pub queues: Vec<String>,

    /// Concurrent jobs
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Drain the queues once and exit
    #[arg(long)]
    pub once: bool,

    /// Also run the cron scheduler in this process
    #[arg(long)]
    pub with_scheduler: bool,
}

#[derive(Debug, Subcommand)]
pub enum ScheduleCommand {
    /// Run tasks due this minute
    RunDue,
    /// Run every enabled task now
    RunAll,
    /// Run the scheduler loop until interrupted
    Work,
    /// List registered tasks
    List,
    /// Enable a task by name
    Enable { name: String },
    /// Disable a task by name
    Disable { name: String },
    /// Remove a persistent task and its history
    Remove { name: String },
    /// Show recent executions of a persistent task
    History {
        uuid: String,
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Persist a task for a registered handler
    Add {
        name: String,
        /// Cron expression or shortcut such as `@daily`
        cron: String,
        handler: String,
        /// JSON parameters passed to the handler
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum FailedCommand {
    /// List failure records, newest first
    List {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value_t = 50)]
        limit: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Show one record
    Show { uuid: String },
    /// Requeue one record
    Retry { uuid: String },
    /// Requeue every retryable record matching the filters
    RetryAll {
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Delete one record
    Forget { uuid: String },
    /// Delete every record
    Flush,
    /// Delete records older than the retention window
    Cleanup {
        /// Override `jobs.failed.retention_days`
        #[arg(long)]
        days: Option<u32>,
    },
    /// Totals and failures in the last 24 hours
    Stats {
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Most frequent failure classes and hourly counts
    Patterns,
    /// Dump records as JSON or CSV
    Export {
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value = "json")]
        format: ExportFormat,
    },
}

#[derive(Debug, Subcommand)]
pub enum DriversCommand {
    /// List registered drivers
    List,
    /// Show a driver's configuration schema
    Schema { name: String },
    /// Health-check every configured connection
    Health,
}

/// Failure record filters shared by several commands.
#[derive(Debug, Default, Args)]
pub struct FilterArgs {
    #[arg(long)]
    pub connection: Option<String>,
    #[arg(long)]
    pub queue: Option<String>,
    #[arg(long)]
    pub job_class: Option<String>,
    #[arg(long)]
    pub exception: Option<String>,
    #[arg(long)]
    pub retryable: Option<bool>,
}

impl From<FilterArgs> for FailedJobFilters {
    fn from(args: FilterArgs) -> Self {
        FailedJobFilters {
            connection: args.connection,
            queue: args.queue,
            job_class: args.job_class,
            exception_class: args.exception,
            retryable: args.retryable,
            ..FailedJobFilters::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_work_queues() {
        let cli = Cli::parse_from(["courier", "work", "--queues", "high,low", "--once"]);
        match cli.command {
            Command::Work(args) => {
                assert_eq!(args.queues, vec!["high", "low"]);
                assert!(args.once);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_long_running_commands() {
        assert!(Cli::parse_from(["courier", "work"]).command.is_long_running());
        assert!(!Cli::parse_from(["courier", "work", "--once"]).command.is_long_running());
        assert!(Cli::parse_from(["courier", "schedule", "work"]).command.is_long_running());
        assert!(!Cli::parse_from(["courier", "failed", "stats"]).command.is_long_running());
    }

    #[test]
    fn test_parse_export_format_and_filters() {
        let cli = Cli::parse_from(["courier", "failed", "export", "--format", "csv", "--queue", "mail"]);
        match cli.command {
            Command::Failed(FailedCommand::Export { filters, format }) => {
                assert_eq!(format, ExportFormat::Csv);
                let filters = FailedJobFilters::from(filters);
                assert_eq!(filters.queue.as_deref(), Some("mail"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
