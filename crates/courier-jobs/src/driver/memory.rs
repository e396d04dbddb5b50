//! In-process queue driver.
//!
//! All state lives behind one mutex, so `pop` is atomic within the process.
//! Jobs are served by priority (highest first), then in push order. A
//! released job is ordered as if it had just been pushed.

use super::{
    report_failure, CommonOptions, ConfigSchema, DriverConfig, DriverContext, DriverInfo,
    DriverStats, HealthStatus, NewJob, QueueDriver, RegisteredDriver,
};
use crate::error::JobResult;
use crate::failure::JobFailure;
use crate::job::{Job, JobId};
use crate::metrics::JobMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
struct StoredJob {
    job: Job,
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// In-memory queue driver.
pub struct MemoryDriver {
    options: CommonOptions,
    state: Mutex<MemoryState>,
    ctx: DriverContext,
}

impl MemoryDriver {
    fn is_visible(&self, job: &Job, now: DateTime<Utc>) -> bool {
        match job.reserved_at {
            None => job.available_at <= now,
            Some(reserved_at) => reservation_expires_at(job, reserved_at, self.options.retry_after) <= now,
        }
    }
}

fn reservation_expires_at(job: &Job, reserved_at: DateTime<Utc>, retry_after: u64) -> DateTime<Utc> {
    let secs = i64::try_from(job.timeout_seconds.saturating_add(retry_after)).unwrap_or(i64::MAX);
    reserved_at + ChronoDuration::try_seconds(secs).unwrap_or(ChronoDuration::MAX)
}

fn delay_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero())
}

impl RegisteredDriver for MemoryDriver {
    const NAME: &'static str = "memory";

    fn driver_info() -> DriverInfo {
        DriverInfo::new(Self::NAME, env!("CARGO_PKG_VERSION"))
            .author("Courier Team")
            .description("In-process queue for tests and single-process deployments")
            .features(["delayed", "priority", "bulk", "purge", "stats"])
    }

    fn schema() -> ConfigSchema {
        CommonOptions::schema()
    }

    fn create(ctx: DriverContext) -> Self {
        Self {
            options: CommonOptions::new(Self::NAME),
            state: Mutex::new(MemoryState::default()),
            ctx,
        }
    }
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&mut self, config: &DriverConfig) -> JobResult<()> {
        self.options = CommonOptions::read(Self::NAME, config);
        Ok(())
    }

    async fn enqueue(&self, job: NewJob) -> JobResult<JobId> {
        job.validate()?;
        let job = job.into_job(&self.options.queue, self.ctx.clock.now());
        let id = job.id.clone();
        JobMetrics::job_pushed(&job.queue, &job.job_class);

        let mut state = self.state.lock();
        let seq = state.next_seq();
        state.jobs.insert(id.clone(), StoredJob { job, seq });
        Ok(id)
    }

    async fn pop(&self, queue: Option<&str>) -> JobResult<Option<Job>> {
        let queue = self.options.queue_or_default(queue);
        let now = self.ctx.clock.now();

        let mut state = self.state.lock();
        let next = state
            .jobs
            .values()
            .filter(|stored| stored.job.queue == queue && self.is_visible(&stored.job, now))
            .max_by_key(|stored| (stored.job.priority, Reverse(stored.seq)))
            .map(|stored| stored.job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };

        Ok(state.jobs.get_mut(&id).map(|stored| {
            stored.job.reserved_at = Some(now);
            stored.job.clone()
        }))
    }

    async fn release(&self, job: &Job, delay: Duration) -> JobResult<()> {
        let available_at = delay_after(self.ctx.clock.now(), delay);

        let mut state = self.state.lock();
        let seq = state.next_seq();
        let stored = state.jobs.entry(job.id.clone()).or_insert_with(|| StoredJob {
            job: job.clone(),
            seq,
        });
        stored.seq = seq;
        stored.job.attempts = job.attempts;
        stored.job.reserved_at = None;
        stored.job.available_at = available_at;

        debug!(job_id = %job.id, delay_ms = delay.as_millis(), "Released job");
        Ok(())
    }

    async fn delete(&self, job: &Job) -> JobResult<()> {
        self.state.lock().jobs.remove(&job.id);
        Ok(())
    }

    async fn size(&self, queue: Option<&str>) -> JobResult<u64> {
        let queue = self.options.queue_or_default(queue);
        let state = self.state.lock();
        let count = state.jobs.values().filter(|s| s.job.queue == queue).count();
        Ok(count as u64)
    }

    async fn purge(&self, queue: Option<&str>) -> JobResult<u64> {
        let queue = self.options.queue_or_default(queue);
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state.jobs.retain(|_, stored| stored.job.queue != queue);
        Ok((before - state.jobs.len()) as u64)
    }

    async fn stats(&self, queue: Option<&str>) -> JobResult<DriverStats> {
        let queue = self.options.queue_or_default(queue);
        let now = self.ctx.clock.now();
        let state = self.state.lock();

        let (mut pending, mut delayed, mut reserved) = (0u64, 0u64, 0u64);
        let mut oldest: Option<DateTime<Utc>> = None;
        for stored in state.jobs.values().filter(|s| s.job.queue == queue) {
            let job = &stored.job;
            if job.reserved_at.is_some() {
                reserved += 1;
            } else if job.available_at > now {
                delayed += 1;
            } else {
                pending += 1;
            }
            oldest = Some(oldest.map_or(job.created_at, |o| o.min(job.created_at)));
        }

        let mut stats = DriverStats::new();
        stats.insert("queue".into(), Value::from(queue));
        stats.insert("size".into(), Value::from(pending + delayed + reserved));
        stats.insert("pending".into(), Value::from(pending));
        stats.insert("delayed".into(), Value::from(delayed));
        stats.insert("reserved".into(), Value::from(reserved));
        stats.insert(
            "oldest_job_age_secs".into(),
            oldest.map_or(Value::Null, |o| Value::from((now - o).num_seconds().max(0))),
        );
        Ok(stats)
    }

    async fn failed(&self, job: &Job, failure: &JobFailure) -> JobResult<()> {
        report_failure(
            self.ctx.failure_logger.as_ref(),
            &self.options.connection,
            job,
            failure,
        )
        .await
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let total = self.state.lock().jobs.len();
        HealthStatus::healthy("In-memory queue available")
            .with_metric("total_jobs", total)
            .with_response_time(started.elapsed())
    }

    fn features(&self) -> Vec<String> {
        Self::driver_info().features
    }

    fn config_schema(&self) -> ConfigSchema {
        Self::schema()
    }

    fn default_queue(&self) -> &str {
        &self.options.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::driver::DEFAULT_RETRY_AFTER;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn driver_with_clock() -> (MemoryDriver, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let driver = MemoryDriver::create(DriverContext::new(Arc::new(clock.clone())));
        (driver, clock)
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let (driver, _) = driver_with_clock();
        let low = driver.push("Low", json!({}), None).await.unwrap();
        let first = driver.enqueue(NewJob::new("High1", json!({})).priority(5)).await.unwrap();
        let second = driver.enqueue(NewJob::new("High2", json!({})).priority(5)).await.unwrap();

        assert_eq!(driver.pop(None).await.unwrap().unwrap().id, first);
        assert_eq!(driver.pop(None).await.unwrap().unwrap().id, second);
        assert_eq!(driver.pop(None).await.unwrap().unwrap().id, low);
        assert!(driver.pop(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_later_is_invisible_until_due() {
        let (driver, clock) = driver_with_clock();
        driver
            .later(Duration::from_secs(60), "Report", json!({}), Some("reports"))
            .await
            .unwrap();

        assert!(driver.pop(Some("reports")).await.unwrap().is_none());
        clock.advance(Duration::from_secs(60));
        assert!(driver.pop(Some("reports")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_reservation_is_visible_again() {
        let (driver, clock) = driver_with_clock();
        driver
            .enqueue(NewJob::new("Slow", json!({})).timeout_seconds(10))
            .await
            .unwrap();

        let job = driver.pop(None).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(10 + DEFAULT_RETRY_AFTER - 1));
        assert!(driver.pop(None).await.unwrap().is_none());
        clock.advance(Duration::from_secs(1));
        assert_eq!(driver.pop(None).await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn test_stats_and_purge() {
        let (driver, _) = driver_with_clock();
        driver.push("A", json!({}), None).await.unwrap();
        driver.later(Duration::from_secs(5), "B", json!({}), None).await.unwrap();
        driver.pop(None).await.unwrap();

        let stats = driver.stats(None).await.unwrap();
        assert_eq!(stats["size"], 2);
        assert_eq!(stats["reserved"], 1);
        assert_eq!(stats["delayed"], 1);

        assert_eq!(driver.purge(None).await.unwrap(), 2);
        assert_eq!(driver.size(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_initialize_sets_default_queue() {
        let (mut driver, _) = driver_with_clock();
        let config: DriverConfig = serde_json::from_value(json!({"queue": "mail"})).unwrap();
        driver.initialize(&config).await.unwrap();

        driver.push("SendEmail", json!({}), None).await.unwrap();
        assert_eq!(driver.size(Some("mail")).await.unwrap(), 1);
        assert_eq!(driver.default_queue(), "mail");
    }

    #[test]
    fn test_release_keeps_attempts() {
        let (driver, clock) = driver_with_clock();
        tokio_test::block_on(async {
            tokio_test::assert_ok!(driver.push("Flaky", json!({}), None).await);
            let mut job = driver.pop(None).await.unwrap().unwrap();
            job.attempts = 2;
            tokio_test::assert_ok!(driver.release(&job, Duration::from_secs(30)).await);

            assert!(driver.pop(None).await.unwrap().is_none());
            clock.advance(Duration::from_secs(30));
            assert_eq!(driver.pop(None).await.unwrap().unwrap().attempts, 2);
        });
    }

    #[tokio::test]
    async fn test_health_check() {
        let (driver, _) = driver_with_clock();
        assert!(driver.health_check().await.is_operational());
    }
}
