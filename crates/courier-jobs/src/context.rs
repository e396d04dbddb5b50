//! Wiring for a running queue system.
//!
//! [`QueueContext`] owns the driver registry, the failed-job provider, the
//! handler registries and the scheduler, and connects them: drivers report
//! terminal failures to the provider, and the provider resolves connections
//! through the registry when it requeues a job.

use crate::clock::{system_clock, SharedClock};
use crate::config::JobsConfig;
use crate::driver::{NewJob, QueueDriver};
use crate::error::JobResult;
use crate::failed::{
    FailedJobProvider, FailedJobStore, MemoryFailedJobStore, MySqlFailedJobStore, MySqlFailedJobStoreParameters,
    QueueResolver,
};
use crate::job::JobId;
use crate::registry::{ConnectionResolver, DriverRegistry, PluginManager};
use crate::scheduler::{
    JobScheduler, LeaseLock, MemoryLeaseLock, MemoryScheduleStore, MySqlScheduleStore, MySqlScheduleStoreParameters,
    RedisLeaseLock, ScheduleStore, TaskRegistry,
};
use crate::worker::{HandlerRegistry, Worker, WorkerPool};
use deadpool_redis::Pool;
use shaku::{module, HasComponent};
use sqlx::mysql::MySqlPool;
use std::sync::Arc;
use tracing::{info, warn};

/// Redis key prefix for scheduler leases.
pub const LEASE_PREFIX: &str = "courier:scheduler";

// Process-local failure and schedule stores.
module! {
    pub MemoryStoreModule {
        components = [
            MemoryFailedJobStore,
            MemoryScheduleStore,
        ],
        providers = [],
    }
}

// MySQL failure and schedule stores sharing one pool.
module! {
    pub MySqlStoreModule {
        components = [
            MySqlFailedJobStore,
            MySqlScheduleStore,
        ],
        providers = [],
    }
}

/// Builds the MySQL store module over an existing pool.
pub fn build_mysql_store_module(pool: MySqlPool) -> MySqlStoreModule {
    MySqlStoreModule::builder()
        .with_component_parameters::<MySqlFailedJobStore>(MySqlFailedJobStoreParameters { pool: pool.clone() })
        .with_component_parameters::<MySqlScheduleStore>(MySqlScheduleStoreParameters { pool })
        .build()
}

/// Storage backing a [`QueueContext`].
pub struct QueueStores {
    pub failed: Arc<dyn FailedJobStore>,
    pub schedule: Arc<dyn ScheduleStore>,
    pub lease: Option<Arc<dyn LeaseLock>>,
}

impl QueueStores {
    /// Process-local stores.
    pub fn memory(config: &JobsConfig) -> Self {
        let lease: Option<Arc<dyn LeaseLock>> = if config.scheduler.use_lease_lock {
            Some(Arc::new(MemoryLeaseLock::new()))
        } else {
            None
        };

        let module = MemoryStoreModule::builder().build();
        Self {
            failed: module.resolve(),
            schedule: module.resolve(),
            lease,
        }
    }

    /// MySQL stores, with Redis leases when enabled and a pool is given.
    pub fn mysql(config: &JobsConfig, pool: MySqlPool, redis: Option<Pool>) -> Self {
        let lease: Option<Arc<dyn LeaseLock>> = match (config.scheduler.use_lease_lock, redis) {
            (true, Some(redis)) => Some(Arc::new(RedisLeaseLock::new(redis, LEASE_PREFIX))),
            (true, None) => {
                warn!("Scheduler lease lock enabled but Redis is not configured; running without leases");
                None
            }
            (false, _) => None,
        };

        let module = build_mysql_store_module(pool);
        Self {
            failed: module.resolve(),
            schedule: module.resolve(),
            lease,
        }
    }
}

/// A configured queue system.
pub struct QueueContext {
    config: JobsConfig,
    clock: SharedClock,
    registry: Arc<DriverRegistry>,
    failed: Arc<FailedJobProvider>,
    handlers: Arc<HandlerRegistry>,
    scheduler: Arc<JobScheduler>,
}

impl QueueContext {
    pub fn new(config: JobsConfig, stores: QueueStores, clock: SharedClock) -> Self {
        let registry = Arc::new(DriverRegistry::new(Arc::new(PluginManager::new()), Arc::clone(&clock)));

        let resolver: Arc<dyn QueueResolver> =
            Arc::new(ConnectionResolver::new(&registry, config.drivers.clone()));
        let failed = Arc::new(FailedJobProvider::new(
            stores.failed,
            resolver,
            &config.failed,
            Arc::clone(&clock),
        ));
        registry.set_failure_logger(failed.clone());

        let mut scheduler = JobScheduler::new(
            stores.schedule,
            Arc::new(TaskRegistry::new()),
            config.scheduler.clone(),
            Arc::clone(&clock),
        );
        if let Some(lease) = stores.lease {
            scheduler = scheduler.with_lease_lock(lease);
        }

        info!(
            default_connection = %config.default_driver,
            connections = config.drivers.len(),
            "Queue context initialized"
        );

        Self {
            config,
            clock,
            registry,
            failed,
            handlers: Arc::new(HandlerRegistry::new()),
            scheduler: Arc::new(scheduler),
        }
    }

    /// A context with in-memory stores and the system clock.
    pub fn in_memory(config: JobsConfig) -> Self {
        let stores = QueueStores::memory(&config);
        Self::new(config, stores, system_clock())
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn failed(&self) -> &Arc<FailedJobProvider> {
        &self.failed
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        self.scheduler.tasks()
    }

    /// Resolves a named connection, or the default one.
    pub async fn connection(&self, name: Option<&str>) -> JobResult<Arc<dyn QueueDriver>> {
        let name = name.unwrap_or(&self.config.default_driver);
        let connection = self.config.connection(name);
        self.registry.get_driver(&connection.driver, &connection.options).await
    }

    /// Pushes a job onto a connection.
    pub async fn dispatch(&self, job: NewJob, connection: Option<&str>) -> JobResult<JobId> {
        self.connection(connection).await?.enqueue(job).await
    }

    /// A worker bound to a connection and the configured queues.
    pub async fn worker(&self, connection: Option<&str>) -> JobResult<Worker> {
        let driver = self.connection(connection).await?;
        Ok(Worker::new(driver, Arc::clone(&self.handlers), &self.config))
    }

    /// A worker pool sized by the worker configuration.
    pub async fn worker_pool(&self, connection: Option<&str>) -> JobResult<WorkerPool> {
        let worker = self.worker(connection).await?;
        Ok(WorkerPool::new(worker, self.config.worker.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::failure::JobFailure;
    use crate::worker::ProcessOutcome;
    use serde_json::json;

    fn memory_config() -> JobsConfig {
        let mut config = JobsConfig::default();
        config.default_driver = "local".into();
        config.drivers.insert(
            "local".into(),
            ConnectionConfig {
                driver: "memory".into(),
                options: serde_json::from_value(json!({"queue": "default"})).unwrap(),
            },
        );
        config
    }

    #[tokio::test]
    async fn test_memory_module_shares_store_instances() {
        let module = MemoryStoreModule::builder().build();
        let a: Arc<dyn FailedJobStore> = module.resolve();
        let b: Arc<dyn FailedJobStore> = module.resolve();

        a.insert(&crate::failed::tests::record("r1", "E", "J")).await.unwrap();
        assert!(b.find("r1").await.unwrap().is_some());

        let schedule: Arc<dyn ScheduleStore> = module.resolve();
        assert!(schedule.jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connection_is_cached() {
        let ctx = QueueContext::in_memory(memory_config());
        let a = ctx.connection(None).await.unwrap();
        let b = ctx.connection(Some("local")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_failed_job_reaches_provider_and_retries() {
        let ctx = QueueContext::in_memory(memory_config());
        ctx.handlers()
            .register_fn("Mailer", |_| async { Err(JobFailure::transient("SmtpError", "refused")) });

        ctx.dispatch(NewJob::new("Mailer", json!({"to": "a@b.c"})).max_attempts(1), None)
            .await
            .unwrap();

        let worker = ctx.worker(None).await.unwrap();
        assert!(matches!(worker.process_next().await.unwrap(), ProcessOutcome::Failed(_)));

        let records = ctx.failed().list(&Default::default(), None, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].connection, "local");
        assert_eq!(records[0].job_class, "Mailer");

        assert!(ctx.failed().retry(&records[0].uuid).await);
        assert_eq!(ctx.connection(None).await.unwrap().size(None).await.unwrap(), 1);
    }
}
