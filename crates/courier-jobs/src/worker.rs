//! Job execution.
//!
//! A [`Worker`] claims one job at a time, runs its handler under the job's
//! timeout and applies the lifecycle rule: success deletes the job, a
//! retryable failure with attempts left releases it with backoff, anything
//! else is reported as failed and deleted. Backend errors are returned to
//! the caller, which backs off before polling again.

use crate::config::{JobsConfig, WorkerConfig};
use crate::driver::QueueDriver;
use crate::error::{JobError, JobResult};
use crate::failure::JobFailure;
use crate::job::{Job, JobId, JobState};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Code run for one job class.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn fire(&self, job: &Job) -> Result<(), JobFailure>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobFailure>> + Send + 'static,
{
    async fn fire(&self, job: &Job) -> Result<(), JobFailure> {
        (self.f)(job.clone()).await
    }
}

/// Handlers keyed by job class.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_class: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_class = job_class.into();
        info!(job_class = %job_class, "Registered job handler");
        self.handlers.write().insert(job_class, handler);
    }

    /// Registers an async closure.
    pub fn register_fn<F, Fut>(&self, job_class: impl Into<String>, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobFailure>> + Send + 'static,
    {
        self.register(job_class, Arc::new(FnHandler { f }));
    }

    pub fn get(&self, job_class: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(job_class).cloned()
    }

    pub fn contains(&self, job_class: &str) -> bool {
        self.handlers.read().contains_key(job_class)
    }

    /// Registered job classes, sorted.
    pub fn job_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.handlers.read().keys().cloned().collect();
        classes.sort();
        classes
    }
}

/// What happened to the job a worker looked at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Every queue was empty.
    Idle,
    Completed(JobId),
    Released {
        id: JobId,
        attempts: u32,
        delay: Duration,
    },
    Failed(JobId),
}

impl ProcessOutcome {
    /// Lifecycle state the job ended in, if a job was processed.
    pub fn state(&self) -> Option<JobState> {
        match self {
            Self::Idle => None,
            Self::Completed(_) => Some(JobState::Completed),
            Self::Released { .. } => Some(JobState::Retrying),
            Self::Failed(_) => Some(JobState::Failed),
        }
    }
}

/// Claims and runs jobs from a driver.
pub struct Worker {
    id: String,
    driver: Arc<dyn QueueDriver>,
    handlers: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    queues: Vec<String>,
}

impl Worker {
    pub fn new(driver: Arc<dyn QueueDriver>, handlers: Arc<HandlerRegistry>, config: &JobsConfig) -> Self {
        let queues = if config.worker.queues.is_empty() {
            vec![driver.default_queue().to_string()]
        } else {
            config.worker.queues.clone()
        };

        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            driver,
            handlers,
            policy: RetryPolicy::from(&config.retry),
            queues,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        if !queues.is_empty() {
            self.queues = queues;
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Pops from the configured queues in order and processes the first job
    /// found.
    pub async fn process_next(&self) -> JobResult<ProcessOutcome> {
        for queue in &self.queues {
            if let Some(job) = self.driver.pop(Some(queue)).await? {
                JobMetrics::job_popped(&job.queue, &job.job_class);
                return self.process(job).await;
            }
        }
        Ok(ProcessOutcome::Idle)
    }

    /// Runs a reserved job and settles it with the driver.
    pub async fn process(&self, mut job: Job) -> JobResult<ProcessOutcome> {
        let started = Instant::now();
        job.mark_attempt();

        debug!(
            worker_id = %self.id,
            job_id = %job.id,
            job_class = %job.job_class,
            attempt = job.attempts,
            "Processing job"
        );

        let result = match self.handlers.get(&job.job_class) {
            Some(handler) => self.fire(handler, &job).await,
            None => Err(JobFailure::permanent(
                "HandlerNotFound",
                format!("No handler registered for job class '{}'", job.job_class),
            )),
        };

        match result {
            Ok(()) => {
                self.driver.delete(&job).await?;
                JobMetrics::job_completed(&job.queue, &job.job_class, started.elapsed());
                debug!(job_id = %job.id, "Job completed successfully");
                Ok(ProcessOutcome::Completed(job.id))
            }
            Err(failure) if job.should_retry(&failure) => {
                let delay = self.policy.delay_for_attempt(job.attempts);
                self.driver.release(&job, delay).await?;
                JobMetrics::job_released(&job.queue, &job.job_class, job.attempts);
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %failure,
                    "Job failed, releasing for retry"
                );
                Ok(ProcessOutcome::Released {
                    id: job.id,
                    attempts: job.attempts,
                    delay,
                })
            }
            Err(failure) => {
                self.driver.failed(&job, &failure).await?;
                self.driver.delete(&job).await?;
                JobMetrics::job_failed(&job.queue, &job.job_class, &failure.class, started.elapsed());
                error!(
                    job_id = %job.id,
                    job_class = %job.job_class,
                    attempts = job.attempts,
                    retryable = failure.is_retryable(),
                    error = %failure,
                    "Job failed permanently"
                );
                Ok(ProcessOutcome::Failed(job.id))
            }
        }
    }

    /// Runs the handler on its own task, bounded by the job's timeout.
    async fn fire(&self, handler: Arc<dyn JobHandler>, job: &Job) -> Result<(), JobFailure> {
        let owned = job.clone();
        let mut task = tokio::spawn(async move { handler.fire(&owned).await });

        match timeout(job.timeout(), &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => Err(JobFailure::permanent("Panic", "Job handler panicked")),
            Ok(Err(e)) => Err(JobFailure::transient("Cancelled", e.to_string())),
            Err(_) => {
                task.abort();
                JobMetrics::job_timed_out(&job.queue, &job.job_class);
                warn!(job_id = %job.id, timeout_secs = job.timeout_seconds, "Job timed out");
                Err(JobFailure::timeout(job.timeout_seconds))
            }
        }
    }
}

/// Runs workers concurrently until stopped.
pub struct WorkerPool {
    id: String,
    worker: Arc<Worker>,
    config: WorkerConfig,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    active: Arc<AtomicUsize>,
    jobs_processed: Arc<AtomicU64>,
    jobs_failed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(worker: Worker, config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            id: format!("worker-pool-{}", Uuid::new_v4()),
            worker: Arc::new(worker),
            config,
            shutdown_tx,
            running: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
            jobs_processed: Arc::new(AtomicU64::new(0)),
            jobs_failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Processes jobs until [`WorkerPool::stop`] is called, then waits up to
    /// the shutdown timeout for in-flight jobs.
    pub async fn start(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Internal("Worker pool already running".to_string()));
        }

        let concurrency = self.config.concurrency.max(1);
        info!(
            pool_id = %self.id,
            concurrency,
            queues = ?self.worker.queues(),
            "Starting worker pool"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(pool_id = %self.id, "Received shutdown signal");
                    break;
                }

                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    let worker = Arc::clone(&self.worker);
                    let active = Arc::clone(&self.active);
                    let processed = Arc::clone(&self.jobs_processed);
                    let failed = Arc::clone(&self.jobs_failed);
                    let poll_interval = self.config.poll_interval();
                    let sleep_on_error = self.config.sleep_on_error();

                    tokio::spawn(async move {
                        WorkerMetrics::set_active(active.fetch_add(1, Ordering::SeqCst) + 1);
                        let pause = match worker.process_next().await {
                            Ok(ProcessOutcome::Idle) => Some(poll_interval),
                            Ok(ProcessOutcome::Failed(_)) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                None
                            }
                            Ok(_) => {
                                processed.fetch_add(1, Ordering::Relaxed);
                                None
                            }
                            Err(e) => {
                                error!(error = %e, infrastructure = e.is_infrastructure(), "Queue operation failed, backing off");
                                Some(sleep_on_error)
                            }
                        };
                        WorkerMetrics::set_active(active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1));
                        if let Some(pause) = pause {
                            tokio::time::sleep(pause).await;
                        }
                        drop(permit);
                    }.instrument(tracing::info_span!("worker")));
                }
            }
        }

        info!(pool_id = %self.id, "Waiting for workers to finish...");
        let drained = timeout(self.config.shutdown_timeout(), async {
            while semaphore.available_permits() < concurrency {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(pool_id = %self.id, "Shutdown timeout reached with jobs still running");
        }

        self.running.store(false, Ordering::SeqCst);
        info!(
            pool_id = %self.id,
            processed = self.jobs_processed(),
            failed = self.jobs_failed(),
            "Worker pool stopped"
        );
        Ok(())
    }

    pub fn stop(&self) {
        info!(pool_id = %self.id, "Stopping worker pool...");
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Jobs that completed or were released for retry.
    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}
