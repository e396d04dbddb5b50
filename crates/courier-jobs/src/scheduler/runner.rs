//! Cron-driven execution of scheduled tasks.

use super::cron::CronExpression;
use super::lease::{LeaseLock, LeaseToken};
use super::store::{ExecutionStatus, JobExecution, ScheduleStore, ScheduledJob};
use super::task::{FnTask, ScheduledTask, TaskRegistry};
use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::error::{JobError, JobResult};
use crate::failure::JobFailure;
use crate::metrics::SchedulerMetrics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of one scheduled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub job_uuid: String,
    pub name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub output: Option<Value>,
    pub error: Option<String>,
}

struct MemoryEntry {
    job: ScheduledJob,
    cron: CronExpression,
    task: Arc<dyn ScheduledTask>,
}

enum Lease {
    Disabled,
    Acquired(LeaseToken),
    Unavailable(Option<String>),
}

fn same_minute(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.timestamp().div_euclid(60) == b.timestamp().div_euclid(60)
}

/// Runs registered tasks on their cron schedules.
///
/// In-process registrations live only as long as the scheduler. Persistent
/// jobs are read from the [`ScheduleStore`] on every run and their handlers
/// are looked up in the [`TaskRegistry`]. With a lease lock attached, each
/// task is claimed before it runs so concurrent schedulers do not both run
/// it.
pub struct JobScheduler {
    id: String,
    store: Arc<dyn ScheduleStore>,
    tasks: Arc<TaskRegistry>,
    memory: RwLock<HashMap<String, MemoryEntry>>,
    lease: Option<Arc<dyn LeaseLock>>,
    config: SchedulerConfig,
    clock: SharedClock,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        tasks: Arc<TaskRegistry>,
        config: SchedulerConfig,
        clock: SharedClock,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            id: format!("scheduler-{}", Uuid::new_v4()),
            store,
            tasks,
            memory: RwLock::new(HashMap::new()),
            lease: None,
            config,
            clock,
            shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Claims a lease per task before running it.
    #[must_use]
    pub fn with_lease_lock(mut self, lease: Arc<dyn LeaseLock>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    /// Registers an in-process task. Replaces an earlier registration with
    /// the same name.
    pub fn register(&self, cron: &str, task: Arc<dyn ScheduledTask>, name: &str) -> JobResult<String> {
        let cron = CronExpression::parse(cron)?;
        let uuid = Uuid::new_v4().to_string();
        let job = ScheduledJob {
            uuid: uuid.clone(),
            name: name.to_string(),
            schedule: cron.as_str().to_string(),
            handler_class: name.to_string(),
            parameters: Value::Null,
            enabled: true,
            last_run: None,
            next_run: cron.next_after(self.clock.now()),
            persistent: false,
        };

        if self
            .memory
            .write()
            .insert(name.to_string(), MemoryEntry { job, cron, task })
            .is_some()
        {
            warn!(job_name = %name, "Replaced scheduled task");
        }
        info!(job_name = %name, job_uuid = %uuid, "Registered scheduled task");
        Ok(uuid)
    }

    /// Registers an in-process async closure.
    pub fn register_fn<F, Fut>(&self, cron: &str, f: F, name: &str) -> JobResult<String>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobFailure>> + Send + 'static,
    {
        self.register(cron, Arc::new(FnTask::new(f)), name)
    }

    /// Persists a scheduled job and returns its uuid. `next_run` is computed
    /// from the current time.
    pub async fn register_in_database(
        &self,
        name: &str,
        cron: &str,
        handler_class: &str,
        parameters: Value,
    ) -> JobResult<String> {
        let cron = CronExpression::parse(cron)?;
        if !self.tasks.contains(handler_class) {
            warn!(
                job_name = %name,
                handler = %handler_class,
                "Scheduled job references a handler not registered in this process"
            );
        }

        let job = ScheduledJob {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            schedule: cron.as_str().to_string(),
            handler_class: handler_class.to_string(),
            parameters,
            enabled: true,
            last_run: None,
            next_run: cron.next_after(self.clock.now()),
            persistent: true,
        };
        self.store.insert_job(&job).await?;

        info!(
            job_name = %name,
            job_uuid = %job.uuid,
            schedule = %job.schedule,
            next_run = ?job.next_run,
            "Registered persistent scheduled job"
        );
        Ok(job.uuid)
    }

    pub async fn enable(&self, name: &str) -> JobResult<bool> {
        self.set_enabled(name, true).await
    }

    pub async fn disable(&self, name: &str) -> JobResult<bool> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> JobResult<bool> {
        let in_memory = match self.memory.write().get_mut(name) {
            Some(entry) => {
                entry.job.enabled = enabled;
                true
            }
            None => false,
        };
        let stored = self.store.set_enabled(name, enabled).await?;
        if in_memory || stored {
            info!(job_name = %name, enabled, "Updated scheduled job");
        }
        Ok(in_memory || stored)
    }

    /// Removes a scheduled job by name.
    pub async fn unregister(&self, name: &str) -> JobResult<bool> {
        let in_memory = self.memory.write().remove(name).is_some();
        let stored = self.store.delete_job(name).await?;
        if in_memory || stored {
            info!(job_name = %name, "Unregistered scheduled job");
        }
        Ok(in_memory || stored)
    }

    /// Every registered job, in-process ones first, each group by name.
    pub async fn list(&self) -> JobResult<Vec<ScheduledJob>> {
        let mut jobs: Vec<ScheduledJob> = self.memory.read().values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs.extend(self.store.jobs().await?);
        Ok(jobs)
    }

    /// Most recent executions of a persistent job.
    pub async fn executions(&self, job_uuid: &str, limit: u64) -> JobResult<Vec<JobExecution>> {
        self.store.executions(job_uuid, limit).await
    }

    /// Runs every enabled job whose cron expression fires this minute.
    pub async fn run_due_jobs(&self) -> Vec<ExecutionReport> {
        self.run(true).await
    }

    /// Runs every enabled job regardless of its schedule.
    pub async fn run_all_jobs(&self) -> Vec<ExecutionReport> {
        self.run(false).await
    }

    async fn run(&self, due_only: bool) -> Vec<ExecutionReport> {
        let now = self.clock.now();
        let is_due = |cron: &CronExpression, job: &ScheduledJob| {
            !due_only || (cron.is_due(now) && !job.last_run.is_some_and(|last| same_minute(last, now)))
        };

        let mut in_memory: Vec<(ScheduledJob, CronExpression, Arc<dyn ScheduledTask>)> = self
            .memory
            .read()
            .values()
            .filter(|e| e.job.enabled && is_due(&e.cron, &e.job))
            .map(|e| (e.job.clone(), e.cron.clone(), Arc::clone(&e.task)))
            .collect();
        in_memory.sort_by(|a, b| a.0.name.cmp(&b.0.name));

        let mut reports = Vec::new();
        for (job, cron, task) in in_memory {
            reports.push(self.execute(&job, &cron, Some(task), due_only).await);
        }

        let stored = match self.store.jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to load scheduled jobs");
                Vec::new()
            }
        };
        for job in stored.into_iter().filter(|j| j.enabled) {
            let cron = match CronExpression::parse(&job.schedule) {
                Ok(cron) => cron,
                Err(e) => {
                    error!(job_name = %job.name, error = %e, "Skipping scheduled job with invalid cron expression");
                    continue;
                }
            };
            if !is_due(&cron, &job) {
                continue;
            }
            let task = self.tasks.get(&job.handler_class);
            reports.push(self.execute(&job, &cron, task, due_only).await);
        }

        debug!(scheduler_id = %self.id, due_only, executed = reports.len(), "Scheduler run finished");
        reports
    }

    async fn acquire_lease(&self, job_uuid: &str) -> Lease {
        let Some(lock) = &self.lease else {
            return Lease::Disabled;
        };
        match lock.acquire(job_uuid, self.config.lease_ttl()).await {
            Ok(Some(token)) => Lease::Acquired(token),
            Ok(None) => Lease::Unavailable(None),
            Err(e) => {
                error!(job_uuid = %job_uuid, error = %e, "Failed to acquire scheduler lease");
                Lease::Unavailable(Some(e.to_string()))
            }
        }
    }

    async fn release_lease(&self, job_uuid: &str, lease: Lease) {
        if let (Some(lock), Lease::Acquired(token)) = (&self.lease, lease) {
            if let Err(e) = lock.release(job_uuid, &token).await {
                warn!(job_uuid = %job_uuid, error = %e, "Failed to release scheduler lease");
            }
        }
    }

    /// True if another process ran this persistent job in the current minute.
    async fn already_ran(&self, job: &ScheduledJob, now: DateTime<Utc>) -> bool {
        match self.store.find_job(&job.uuid).await {
            Ok(Some(current)) => current.last_run.is_some_and(|last| same_minute(last, now)),
            Ok(None) => true,
            Err(e) => {
                warn!(job_uuid = %job.uuid, error = %e, "Failed to reload scheduled job");
                false
            }
        }
    }

    async fn execute(
        &self,
        job: &ScheduledJob,
        cron: &CronExpression,
        task: Option<Arc<dyn ScheduledTask>>,
        due_only: bool,
    ) -> ExecutionReport {
        let started_at = self.clock.now();
        let timer = std::time::Instant::now();

        let lease = self.acquire_lease(&job.uuid).await;
        if let Lease::Unavailable(error) = lease {
            debug!(job_name = %job.name, "Scheduled job is leased elsewhere, skipping");
            SchedulerMetrics::execution(&job.name, ExecutionStatus::Skipped.as_str());
            return report(job, ExecutionStatus::Skipped, started_at, 0, None, error);
        }
        if due_only && job.persistent && self.already_ran(job, started_at).await {
            self.release_lease(&job.uuid, lease).await;
            SchedulerMetrics::execution(&job.name, ExecutionStatus::Skipped.as_str());
            return report(job, ExecutionStatus::Skipped, started_at, 0, None, None);
        }

        let execution_uuid = Uuid::new_v4().to_string();
        if job.persistent {
            let execution = JobExecution {
                uuid: execution_uuid.clone(),
                job_uuid: job.uuid.clone(),
                status: ExecutionStatus::Running,
                started_at,
                completed_at: None,
                result: None,
            };
            if let Err(e) = self.store.insert_execution(&execution).await {
                error!(job_name = %job.name, error = %e, "Failed to record execution start");
            }
        }

        let outcome = match task {
            Some(task) => run_isolated(task, job.parameters.clone()).await,
            None => Err(format!("No handler registered for '{}'", job.handler_class)),
        };

        let duration_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);
        let next_run = cron.next_after(started_at);
        let (status, output, error) = match outcome {
            Ok(output) => {
                info!(job_name = %job.name, duration_ms, next_run = ?next_run, "Scheduled job completed");
                (ExecutionStatus::Completed, Some(output), None)
            }
            Err(message) => {
                error!(job_name = %job.name, error = %message, duration_ms, "Scheduled job failed");
                (ExecutionStatus::Failed, None, Some(message))
            }
        };

        if job.persistent {
            let result = match (&output, &error) {
                (_, Some(message)) => Some(message.clone()),
                (Some(Value::Null) | None, None) => None,
                (Some(value), None) => Some(value.to_string()),
            };
            if let Err(e) = self
                .store
                .finish_execution(&execution_uuid, status, self.clock.now(), result)
                .await
            {
                error!(job_name = %job.name, error = %e, "Failed to record execution result");
            }
            if let Err(e) = self.store.record_run(&job.uuid, started_at, next_run).await {
                error!(job_name = %job.name, error = %e, "Failed to update next run");
            }
        } else if let Some(entry) = self.memory.write().get_mut(&job.name) {
            if entry.job.uuid == job.uuid {
                entry.job.last_run = Some(started_at);
                entry.job.next_run = next_run;
            }
        }

        self.release_lease(&job.uuid, lease).await;
        SchedulerMetrics::execution(&job.name, status.as_str());
        report(job, status, started_at, duration_ms, output, error)
    }

    /// Polls for due jobs until [`JobScheduler::stop`] is called.
    pub async fn start(&self) -> JobResult<()> {
        if !self.config.enabled {
            info!(scheduler_id = %self.id, "Scheduler disabled by configuration");
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Scheduler("Scheduler already running".to_string()));
        }

        info!(
            scheduler_id = %self.id,
            poll_interval_secs = self.config.poll_interval_secs,
            lease_lock = self.lease.is_some(),
            "Starting scheduler"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut poll = interval(self.config.poll_interval());

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(scheduler_id = %self.id, "Received shutdown signal");
                    break;
                }
                _ = poll.tick() => {
                    self.run_due_jobs().await;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(scheduler_id = %self.id, "Scheduler stopped");
        Ok(())
    }

    pub fn stop(&self) {
        info!(scheduler_id = %self.id, "Stopping scheduler...");
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn report(
    job: &ScheduledJob,
    status: ExecutionStatus,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    output: Option<Value>,
    error: Option<String>,
) -> ExecutionReport {
    ExecutionReport {
        job_uuid: job.uuid.clone(),
        name: job.name.clone(),
        status,
        started_at,
        duration_ms,
        output,
        error,
    }
}

/// Runs a task on its own tokio task so a panic is reported as a failure.
async fn run_isolated(task: Arc<dyn ScheduledTask>, parameters: Value) -> Result<Value, String> {
    let handle = tokio::spawn(async move { task.run(&parameters).await });
    match handle.await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(failure)) => Err(failure.to_string()),
        Err(e) if e.is_panic() => Err("Scheduled task panicked".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::{MemoryLeaseLock, MemoryScheduleStore};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn scheduler_at(start: DateTime<Utc>) -> (JobScheduler, ManualClock, Arc<MemoryScheduleStore>) {
        let clock = ManualClock::new(start);
        let store = Arc::new(MemoryScheduleStore::new());
        let scheduler = JobScheduler::new(
            store.clone(),
            Arc::new(TaskRegistry::new()),
            SchedulerConfig::default(),
            Arc::new(clock.clone()),
        );
        (scheduler, clock, store)
    }

    fn counter_task(
        counter: Arc<AtomicUsize>,
    ) -> impl Fn(Value) -> futures::future::Ready<Result<Value, JobFailure>> {
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(Value::Null))
        }
    }

    #[tokio::test]
    async fn test_run_due_jobs_respects_cron_and_minute_guard() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 5).unwrap();
        let (scheduler, clock, _) = scheduler_at(start);
        let hourly = Arc::new(AtomicUsize::new(0));
        let never = Arc::new(AtomicUsize::new(0));
        scheduler.register_fn("0 * * * *", counter_task(Arc::clone(&hourly)), "hourly").unwrap();
        scheduler.register_fn("30 3 * * *", counter_task(Arc::clone(&never)), "nightly").unwrap();

        let reports = scheduler.run_due_jobs().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, ExecutionStatus::Completed);

        clock.advance(std::time::Duration::from_secs(20));
        assert!(scheduler.run_due_jobs().await.is_empty());

        assert_eq!(hourly.load(Ordering::SeqCst), 1);
        assert_eq!(never.load(Ordering::SeqCst), 0);

        let listed = scheduler.list().await.unwrap();
        let hourly_job = listed.iter().find(|j| j.name == "hourly").unwrap();
        assert_eq!(hourly_job.last_run, Some(start));
        assert_eq!(
            hourly_job.next_run,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_failure_and_panic_do_not_stop_other_jobs() {
        let (scheduler, _, _) = scheduler_at(Utc::now());
        let ran = Arc::new(AtomicUsize::new(0));
        scheduler
            .register_fn(
                "* * * * *",
                |_| async { Err(JobFailure::transient("RuntimeException", "boom")) },
                "a-fails",
            )
            .unwrap();
        scheduler
            .register_fn(
                "* * * * *",
                |_| async {
                    if true {
                        panic!("task exploded");
                    }
                    Ok(Value::Null)
                },
                "b-panics",
            )
            .unwrap();
        scheduler.register_fn("* * * * *", counter_task(Arc::clone(&ran)), "c-works").unwrap();

        let reports = scheduler.run_all_jobs().await;
        assert_eq!(reports.len(), 3);
        let failed = reports.iter().filter(|r| r.status == ExecutionStatus::Failed).count();
        assert_eq!(failed, 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistent_job_records_execution() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap();
        let (scheduler, _, store) = scheduler_at(start);
        scheduler
            .tasks()
            .register_fn("Prune", |params| async move { Ok(json!({"pruned": params["days"]})) });

        let uuid = scheduler
            .register_in_database("prune", "0 * * * *", "Prune", json!({"days": 30}))
            .await
            .unwrap();
        let stored = store.find_job(&uuid).await.unwrap().unwrap();
        assert_eq!(stored.next_run, Some(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()));

        let reports = scheduler.run_all_jobs().await;
        assert_eq!(reports[0].output, Some(json!({"pruned": 30})));

        let executions = scheduler.executions(&uuid, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Completed);
        assert_eq!(executions[0].result.as_deref(), Some(r#"{"pruned":30}"#));

        let stored = store.find_job(&uuid).await.unwrap().unwrap();
        assert_eq!(stored.last_run, Some(start));
        assert_eq!(stored.next_run, Some(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_missing_handler_fails_execution() {
        let (scheduler, _, _) = scheduler_at(Utc::now());
        let uuid = scheduler
            .register_in_database("orphan", "@daily", "Unknown", Value::Null)
            .await
            .unwrap();

        let reports = scheduler.run_all_jobs().await;
        assert_eq!(reports[0].status, ExecutionStatus::Failed);
        let executions = scheduler.executions(&uuid, 1).await.unwrap();
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_held_lease_skips_job() {
        let (scheduler, _, _) = scheduler_at(Utc::now());
        let lock = Arc::new(MemoryLeaseLock::new());
        let scheduler = scheduler.with_lease_lock(lock.clone());
        let ran = Arc::new(AtomicUsize::new(0));
        let uuid = scheduler.register_fn("* * * * *", counter_task(Arc::clone(&ran)), "leased").unwrap();

        let held = lock.acquire(&uuid, std::time::Duration::from_secs(60)).await.unwrap().unwrap();
        let reports = scheduler.run_all_jobs().await;
        assert_eq!(reports[0].status, ExecutionStatus::Skipped);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        lock.release(&uuid, &held).await.unwrap();
        let reports = scheduler.run_all_jobs().await;
        assert_eq!(reports[0].status, ExecutionStatus::Completed);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enable_disable_unregister() {
        let (scheduler, _, _) = scheduler_at(Utc::now());
        let ran = Arc::new(AtomicUsize::new(0));
        scheduler.register_fn("* * * * *", counter_task(Arc::clone(&ran)), "tick").unwrap();
        scheduler
            .register_in_database("stored", "* * * * *", "Missing", Value::Null)
            .await
            .unwrap();

        assert!(scheduler.disable("tick").await.unwrap());
        assert!(scheduler.disable("stored").await.unwrap());
        assert!(scheduler.run_all_jobs().await.is_empty());

        assert!(scheduler.enable("tick").await.unwrap());
        assert_eq!(scheduler.run_all_jobs().await.len(), 1);

        assert!(scheduler.unregister("tick").await.unwrap());
        assert!(scheduler.unregister("stored").await.unwrap());
        assert!(!scheduler.unregister("tick").await.unwrap());
        assert!(scheduler.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let (scheduler, _, _) = scheduler_at(Utc::now());
        let err = scheduler
            .register_fn("not a cron", |_| async { Ok(Value::Null) }, "bad")
            .unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
    }
}
