//! Startup and command execution.

use crate::builtin::register_builtin_tasks;
use crate::cli::{Cli, Command, DriversCommand, FailedCommand, ScheduleCommand, WorkArgs};
use anyhow::{bail, Context, Result};
use courier_config::{init_logging, AppConfig, ConfigLoader};
use courier_jobs::db::{create_mysql_pool, create_redis_pool, run_migrations};
use courier_jobs::{
    register_metrics, system_clock, FailedJobFilters, JobsConfig, ProcessOutcome, QueueContext, QueueStores,
    WorkerPool,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Loads configuration, installs logging and metrics, and runs the command.
pub async fn run(cli: Cli) -> Result<()> {
    let loader = ConfigLoader::new(cli.config_dir.as_str()).context("Failed to load configuration")?;
    let config = loader.get().await;
    let jobs: JobsConfig = loader.section("jobs").await.context("Invalid `jobs` configuration")?;

    init_logging(&config.observability)?;
    info!(version = env!("CARGO_PKG_VERSION"), environment = %config.app.environment, "Starting Courier");

    if config.observability.metrics_enabled && cli.command.is_long_running() {
        install_metrics_exporter(&config)?;
    }

    if let Command::Migrate = cli.command {
        let pool = create_mysql_pool(&config.database).await?;
        run_migrations(&pool).await?;
        return Ok(());
    }

    let ctx = Arc::new(build_context(&config, jobs, cli.in_memory).await?);
    register_builtin_tasks(&ctx);
    execute(ctx, cli.command).await
}

fn install_metrics_exporter(config: &AppConfig) -> Result<()> {
    let addr: SocketAddr = config
        .observability
        .metrics_addr
        .parse()
        .context("Invalid metrics address")?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    register_metrics();
    info!(addr = %addr, "Metrics exporter listening");
    Ok(())
}

/// Builds the queue context on MySQL stores, or in-memory ones.
pub async fn build_context(config: &AppConfig, jobs: JobsConfig, in_memory: bool) -> Result<QueueContext> {
    if in_memory {
        warn!("Using in-memory failure and schedule stores; nothing survives a restart");
        return Ok(QueueContext::in_memory(jobs));
    }

    let pool = create_mysql_pool(&config.database).await?;
    if config.database.run_migrations {
        run_migrations(&pool).await?;
    }
    let redis = if config.redis.enabled {
        Some(create_redis_pool(&config.redis).await?)
    } else {
        None
    };

    let stores = QueueStores::mysql(&jobs, pool, redis);
    Ok(QueueContext::new(jobs, stores, system_clock()))
}

async fn execute(ctx: Arc<QueueContext>, command: Command) -> Result<()> {
    match command {
        Command::Work(args) => work(ctx, args).await,
        Command::Schedule(cmd) => schedule(&ctx, cmd).await,
        Command::Failed(cmd) => failed(&ctx, cmd).await,
        Command::Drivers(cmd) => drivers(&ctx, cmd).await,
        Command::Migrate => Ok(()),
    }
}

async fn work(ctx: Arc<QueueContext>, args: WorkArgs) -> Result<()> {
    let mut worker_config = ctx.config().worker.clone();
    if let Some(concurrency) = args.concurrency {
        worker_config.concurrency = concurrency;
    }
    let worker = ctx.worker(args.connection.as_deref()).await?.with_queues(args.queues);

    if args.once {
        let mut processed = 0u64;
        while worker.process_next().await? != ProcessOutcome::Idle {
            processed += 1;
        }
        info!(processed, "Queues drained");
        return Ok(());
    }

    let pool = Arc::new(WorkerPool::new(worker, worker_config));
    let pool_task = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.start().await })
    };
    let scheduler_task = args.with_scheduler.then(|| {
        let scheduler = Arc::clone(ctx.scheduler());
        tokio::spawn(async move { scheduler.start().await })
    });

    shutdown_signal().await;
    pool.stop();
    ctx.scheduler().stop();

    pool_task.await??;
    if let Some(task) = scheduler_task {
        task.await??;
    }
    Ok(())
}

async fn schedule(ctx: &QueueContext, cmd: ScheduleCommand) -> Result<()> {
    let scheduler = ctx.scheduler();
    match cmd {
        ScheduleCommand::RunDue => print_json(&scheduler.run_due_jobs().await),
        ScheduleCommand::RunAll => print_json(&scheduler.run_all_jobs().await),
        ScheduleCommand::Work => {
            let task = {
                let scheduler = Arc::clone(scheduler);
                tokio::spawn(async move { scheduler.start().await })
            };
            shutdown_signal().await;
            scheduler.stop();
            task.await??;
            Ok(())
        }
        ScheduleCommand::List => print_json(&scheduler.list().await?),
        ScheduleCommand::Enable { name } => report_found(&name, scheduler.enable(&name).await?),
        ScheduleCommand::Disable { name } => report_found(&name, scheduler.disable(&name).await?),
        ScheduleCommand::Remove { name } => report_found(&name, scheduler.unregister(&name).await?),
        ScheduleCommand::History { uuid, limit } => print_json(&scheduler.executions(&uuid, limit).await?),
        ScheduleCommand::Add {
            name,
            cron,
            handler,
            params,
        } => {
            let params: Value = serde_json::from_str(&params).context("--params must be JSON")?;
            let uuid = scheduler.register_in_database(&name, &cron, &handler, params).await?;
            println!("{uuid}");
            Ok(())
        }
    }
}

async fn failed(ctx: &QueueContext, cmd: FailedCommand) -> Result<()> {
    let provider = ctx.failed();
    match cmd {
        FailedCommand::List { filters, limit, offset } => {
            print_json(&provider.list(&filters.into(), Some(limit), offset).await?)
        }
        FailedCommand::Show { uuid } => match provider.find(&uuid).await? {
            Some(record) => print_json(&record),
            None => bail!("Failed job '{uuid}' not found"),
        },
        FailedCommand::Retry { uuid } => {
            if provider.retry(&uuid).await {
                println!("Requeued {uuid}");
                Ok(())
            } else {
                bail!("Failed job '{uuid}' could not be requeued")
            }
        }
        FailedCommand::RetryAll { filters } => {
            let results = provider.retry_all(&filters.into()).await;
            let requeued = results.values().filter(|r| **r).count();
            print_json(&results)?;
            info!(selected = results.len(), requeued, "Retry finished");
            Ok(())
        }
        FailedCommand::Forget { uuid } => report_found(&uuid, provider.forget(&uuid).await?),
        FailedCommand::Flush => {
            println!("Removed {} failed jobs", provider.flush().await?);
            Ok(())
        }
        FailedCommand::Cleanup { days } => {
            if provider.cleanup(days).await {
                Ok(())
            } else {
                bail!("Failed job cleanup did not complete")
            }
        }
        FailedCommand::Stats { filters } => print_json(&provider.stats(&filters.into()).await?),
        FailedCommand::Patterns => print_json(&provider.failure_patterns().await?),
        FailedCommand::Export { filters, format } => {
            let filters: FailedJobFilters = filters.into();
            println!("{}", provider.export(&filters, format).await?);
            Ok(())
        }
    }
}

async fn drivers(ctx: &QueueContext, cmd: DriversCommand) -> Result<()> {
    let registry = ctx.registry();
    match cmd {
        DriversCommand::List => {
            for info in registry.available_drivers() {
                println!("{:<10} {:<8} {}", info.name, info.version, info.description);
            }
            Ok(())
        }
        DriversCommand::Schema { name } => match registry.driver_schema(&name) {
            Some(schema) => print_json(&schema.describe()),
            None => bail!("Queue driver '{name}' is not registered"),
        },
        DriversCommand::Health => {
            let mut names: Vec<&String> = ctx.config().drivers.keys().collect();
            names.sort();
            for name in names {
                if let Err(e) = ctx.connection(Some(name)).await {
                    error!(connection = %name, error = %e, "Connection could not be initialized");
                }
            }
            print_json(&registry.health_check_all().await)
        }
    }
}

fn report_found(name: &str, found: bool) -> Result<()> {
    if found {
        println!("OK {name}");
        Ok(())
    } else {
        bail!("'{name}' not found")
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        () = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
