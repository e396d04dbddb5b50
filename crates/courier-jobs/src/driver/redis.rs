//! Redis sorted-set queue driver.
//!
//! Each queue uses three sorted sets: ready jobs scored by priority and
//! enqueue time, delayed jobs scored by visibility time, and reserved jobs
//! scored by reservation expiry. Job bodies live in plain string keys.
//!
//! `pop` runs as one Lua script: it moves due delayed jobs and expired
//! reservations back to the ready set, pops the best ready job and records
//! its reservation. Jobs are served by priority (highest first), then by
//! enqueue time at millisecond resolution. `purge` is a second script that
//! clears the three sets and their job bodies in one step. Both scripts touch
//! job keys they do not declare, so the driver requires a non-clustered Redis.

use super::{
    report_failure, string_option, BulkPushResult, CommonOptions, ConfigSchema, DriverConfig,
    DriverContext, DriverInfo, DriverStats, FieldSpec, FieldType, HealthStatus, NewJob,
    QueueDriver, RegisteredDriver,
};
use crate::error::{JobError, JobResult};
use crate::failure::JobFailure;
use crate::job::{Job, JobId};
use crate::metrics::JobMetrics;
use ::redis::Script;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_PREFIX: &str = "courier";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Priority weight in ready-set scores. One priority step outweighs any
/// realistic span of enqueue timestamps in milliseconds.
const PRIORITY_WEIGHT: f64 = 1e13;

const POP_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local job_prefix = ARGV[3]

local function migrate(from)
    local ids = redis.call('zrangebyscore', from, '-inf', now)
    for _, id in ipairs(ids) do
        redis.call('zrem', from, id)
        local raw = redis.call('get', job_prefix .. id)
        if raw then
            local job = cjson.decode(raw)
            local priority = tonumber(job['priority']) or 0
            redis.call('zadd', KEYS[1], string.format('%.0f', -priority * 1e13 + now), id)
        end
    end
end

migrate(KEYS[2])
migrate(KEYS[3])

local popped = redis.call('zpopmin', KEYS[1])
if #popped == 0 then
    return false
end

local id = popped[1]
local raw = redis.call('get', job_prefix .. id)
if not raw then
    return false
end

local job = cjson.decode(raw)
local timeout = tonumber(job['timeout_seconds']) or 60
redis.call('zadd', KEYS[3], string.format('%.0f', now + timeout * 1000 + tonumber(ARGV[2])), id)
return raw
";

const PURGE_SCRIPT: &str = r"
local job_prefix = ARGV[1]
local purged = 0

for i = 1, #KEYS do
    local ids = redis.call('zrange', KEYS[i], 0, -1)
    for _, id in ipairs(ids) do
        redis.call('del', job_prefix .. id)
    end
    purged = purged + #ids
    redis.call('del', KEYS[i])
end

return purged
";

/// Redis key builder for queue data.
#[derive(Debug, Clone)]
pub struct RedisQueueKeys {
    prefix: String,
}

impl RedisQueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Ready jobs (sorted set by priority, then enqueue time).
    pub fn ready(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    /// Delayed jobs (sorted set by visibility time).
    pub fn delayed(&self, queue: &str) -> String {
        format!("{}:delayed:{}", self.prefix, queue)
    }

    /// Reserved jobs (sorted set by reservation expiry).
    pub fn reserved(&self, queue: &str) -> String {
        format!("{}:reserved:{}", self.prefix, queue)
    }

    /// Prefix of job body keys.
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    /// Job body key.
    pub fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }
}

/// Score of a ready job.
#[allow(clippy::cast_precision_loss)]
fn ready_score(priority: i32, at: DateTime<Utc>) -> f64 {
    -f64::from(priority) * PRIORITY_WEIGHT + at.timestamp_millis() as f64
}

#[allow(clippy::cast_precision_loss)]
fn millis(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

/// Redis queue driver.
pub struct RedisDriver {
    options: CommonOptions,
    keys: RedisQueueKeys,
    pool: Option<Pool>,
    pop_script: Script,
    purge_script: Script,
    ctx: DriverContext,
}

impl RedisDriver {
    /// Creates a driver over an existing pool.
    pub fn with_pool(pool: Pool, ctx: DriverContext) -> Self {
        Self {
            pool: Some(pool),
            ..Self::create(ctx)
        }
    }

    async fn connection(&self) -> JobResult<deadpool_redis::Connection> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| JobError::Configuration("Redis driver is not initialized".into()))?;
        Ok(pool.get().await?)
    }

    /// Adds store commands for one job to a pipeline.
    fn stage(&self, pipe: &mut ::redis::Pipeline, job: &Job, now: DateTime<Utc>) -> JobResult<()> {
        let body = serde_json::to_string(job)?;
        pipe.set(self.keys.job(&job.id), body).ignore();
        if job.available_at > now {
            pipe.zadd(self.keys.delayed(&job.queue), job.id.as_str(), millis(job.available_at))
                .ignore();
        } else {
            pipe.zadd(
                self.keys.ready(&job.queue),
                job.id.as_str(),
                ready_score(job.priority, now),
            )
            .ignore();
        }
        Ok(())
    }

    fn build_pool(config: &DriverConfig) -> JobResult<Pool> {
        let host = string_option(config, "host").ok_or_else(|| {
            JobError::invalid_configuration(Self::NAME, vec!["host is required".into()])
        })?;
        let port = config.get("port").and_then(Value::as_u64).unwrap_or(6379);
        let database = config.get("database").and_then(Value::as_u64).unwrap_or(0);
        let url = match string_option(config, "password") {
            Some(password) => format!("redis://:{password}@{host}:{port}/{database}"),
            None => format!("redis://{host}:{port}/{database}"),
        };
        let pool_size = config
            .get("pool_size")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(10);

        Config::from_url(url)
            .builder()
            .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {e}")))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| JobError::Configuration(format!("Failed to create pool: {e}")))
    }
}

impl RegisteredDriver for RedisDriver {
    const NAME: &'static str = "redis";

    fn driver_info() -> DriverInfo {
        DriverInfo::new(Self::NAME, env!("CARGO_PKG_VERSION"))
            .author("Courier Team")
            .description("Redis sorted-set queue with atomic Lua pop")
            .features(["delayed", "priority", "bulk", "purge", "stats"])
            .dependency("redis", ">=6.2")
    }

    fn schema() -> ConfigSchema {
        CommonOptions::schema()
            .field("host", FieldSpec::required(FieldType::String).description("Redis host"))
            .field("port", FieldSpec::optional(FieldType::Port).default_value(6379))
            .field("database", FieldSpec::optional(FieldType::Int).default_value(0))
            .field("password", FieldSpec::optional(FieldType::String))
            .field(
                "prefix",
                FieldSpec::optional(FieldType::String)
                    .default_value(DEFAULT_PREFIX)
                    .validator(|v| match v.as_str() {
                        Some(s) if s.contains(char::is_whitespace) => {
                            Err("must not contain whitespace".to_string())
                        }
                        _ => Ok(()),
                    }),
            )
            .field("pool_size", FieldSpec::optional(FieldType::Int).default_value(10))
    }

    fn create(ctx: DriverContext) -> Self {
        Self {
            options: CommonOptions::new(Self::NAME),
            keys: RedisQueueKeys::new(DEFAULT_PREFIX),
            pool: None,
            pop_script: Script::new(POP_SCRIPT),
            purge_script: Script::new(PURGE_SCRIPT),
            ctx,
        }
    }
}

#[async_trait]
impl QueueDriver for RedisDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&mut self, config: &DriverConfig) -> JobResult<()> {
        self.options = CommonOptions::read(Self::NAME, config);
        self.keys = RedisQueueKeys::new(
            string_option(config, "prefix").unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        );

        if self.pool.is_none() {
            self.pool = Some(Self::build_pool(config)?);
        }

        info!(driver = Self::NAME, prefix = %self.keys.prefix, "Redis queue driver initialized");
        Ok(())
    }

    async fn enqueue(&self, job: NewJob) -> JobResult<JobId> {
        job.validate()?;
        let now = self.ctx.clock.now();
        let job = job.into_job(&self.options.queue, now);

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        self.stage(&mut pipe, &job, now)?;

        let mut conn = self.connection().await?;
        let _: () = pipe.query_async(&mut *conn).await?;
        JobMetrics::job_pushed(&job.queue, &job.job_class);
        debug!(job_id = %job.id, queue = %job.queue, "Pushed job");
        Ok(job.id)
    }

    async fn pop(&self, queue: Option<&str>) -> JobResult<Option<Job>> {
        let queue = self.options.queue_or_default(queue);
        let now = self.ctx.clock.now();
        let grace_ms = self.options.retry_after.saturating_mul(1000);

        let mut conn = self.connection().await?;
        let raw: Option<String> = self
            .pop_script
            .key(self.keys.ready(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.reserved(queue))
            .arg(now.timestamp_millis())
            .arg(grace_ms)
            .arg(self.keys.job_prefix())
            .invoke_async(&mut *conn)
            .await?;

        match raw {
            Some(raw) => {
                let mut job: Job = serde_json::from_str(&raw)?;
                job.reserved_at = Some(now);
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn release(&self, job: &Job, delay: Duration) -> JobResult<()> {
        let now = self.ctx.clock.now();
        let mut released = job.clone();
        released.reserved_at = None;
        released.available_at =
            now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());

        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .zrem(self.keys.reserved(&job.queue), job.id.as_str())
            .ignore()
            .set(self.keys.job(&job.id), serde_json::to_string(&released)?)
            .ignore()
            .zadd(
                self.keys.delayed(&job.queue),
                job.id.as_str(),
                millis(released.available_at),
            )
            .ignore();

        let mut conn = self.connection().await?;
        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }

    async fn delete(&self, job: &Job) -> JobResult<()> {
        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .del(self.keys.job(&job.id))
            .ignore()
            .zrem(self.keys.ready(&job.queue), job.id.as_str())
            .ignore()
            .zrem(self.keys.delayed(&job.queue), job.id.as_str())
            .ignore()
            .zrem(self.keys.reserved(&job.queue), job.id.as_str())
            .ignore();

        let mut conn = self.connection().await?;
        let _: () = pipe.query_async(&mut *conn).await?;
        Ok(())
    }

    async fn size(&self, queue: Option<&str>) -> JobResult<u64> {
        let queue = self.options.queue_or_default(queue);
        let mut conn = self.connection().await?;
        let (ready, delayed, reserved): (u64, u64, u64) = ::redis::pipe()
            .zcard(self.keys.ready(queue))
            .zcard(self.keys.delayed(queue))
            .zcard(self.keys.reserved(queue))
            .query_async(&mut *conn)
            .await?;
        Ok(ready + delayed + reserved)
    }

    async fn bulk(&self, jobs: Vec<NewJob>, queue: Option<&str>) -> JobResult<BulkPushResult> {
        let now = self.ctx.clock.now();
        let mut ids = Vec::with_capacity(jobs.len());
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        let mut staged = 0usize;

        for (index, mut job) in jobs.into_iter().enumerate() {
            if job.queue.is_none() {
                job.queue = queue.map(str::to_string);
            }
            if let Err(e) = job.validate() {
                warn!(driver = Self::NAME, index, error = %e, "Bulk entry rejected");
                ids.push(None);
                continue;
            }
            let job = job.into_job(&self.options.queue, now);
            self.stage(&mut pipe, &job, now)?;
            ids.push(Some(job.id));
            staged += 1;
        }

        if staged > 0 {
            let mut conn = self.connection().await?;
            let _: () = pipe.query_async(&mut *conn).await?;
        }
        Ok(BulkPushResult { ids })
    }

    async fn purge(&self, queue: Option<&str>) -> JobResult<u64> {
        let queue = self.options.queue_or_default(queue);
        let mut conn = self.connection().await?;
        let purged: u64 = self
            .purge_script
            .key(self.keys.ready(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.reserved(queue))
            .arg(self.keys.job_prefix())
            .invoke_async(&mut *conn)
            .await?;

        info!(queue = %queue, purged, "Purged queue");
        Ok(purged)
    }

    async fn stats(&self, queue: Option<&str>) -> JobResult<DriverStats> {
        let queue = self.options.queue_or_default(queue);
        let mut conn = self.connection().await?;
        let (ready, delayed, reserved): (u64, u64, u64) = ::redis::pipe()
            .zcard(self.keys.ready(queue))
            .zcard(self.keys.delayed(queue))
            .zcard(self.keys.reserved(queue))
            .query_async(&mut *conn)
            .await?;

        let mut stats = DriverStats::new();
        stats.insert("queue".into(), Value::from(queue));
        stats.insert("size".into(), Value::from(ready + delayed + reserved));
        stats.insert("pending".into(), Value::from(ready));
        stats.insert("delayed".into(), Value::from(delayed));
        stats.insert("reserved".into(), Value::from(reserved));
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
        let Some(pool) = self.pool.as_ref() else {
            return HealthStatus::unknown("Redis driver is not initialized");
        };

        let started = Instant::now();
        let probe = async {
            let mut conn = pool.get().await.map_err(|e| e.to_string())?;
            ::redis::cmd("PING")
                .query_async::<String>(&mut *conn)
                .await
                .map_err(|e| e.to_string())
        };

        let status = pool.status();
        match tokio::time::timeout(HEALTH_TIMEOUT, probe).await {
            Ok(Ok(_)) => HealthStatus::healthy("Redis connection OK")
                .with_metric("pool_size", status.size)
                .with_metric("pool_available", status.available)
                .with_response_time(started.elapsed()),
            Ok(Err(e)) => {
                warn!(driver = Self::NAME, error = %e, "Redis health check failed");
                HealthStatus::unhealthy(format!("Redis ping failed: {e}"))
                    .with_response_time(started.elapsed())
            }
            Err(_) => {
                warn!(driver = Self::NAME, "Redis health check timed out");
                HealthStatus::unhealthy("Redis health check timed out")
                    .with_response_time(started.elapsed())
            }
        }
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
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_key_builder() {
        let keys = RedisQueueKeys::new("app");
        assert_eq!(keys.ready("mail"), "app:queue:mail");
        assert_eq!(keys.delayed("mail"), "app:delayed:mail");
        assert_eq!(keys.reserved("mail"), "app:reserved:mail");
        assert_eq!(keys.job(&JobId::from("j1")), "app:job:j1");
        assert!(keys.job(&JobId::from("j1")).starts_with(&keys.job_prefix()));
    }

    #[test]
    fn test_purge_script_clears_every_set_in_one_call() {
        assert!(PURGE_SCRIPT.contains("for i = 1, #KEYS do"));
        assert!(PURGE_SCRIPT.contains("redis.call('del', job_prefix .. id)"));
        assert!(PURGE_SCRIPT.contains("redis.call('del', KEYS[i])"));
    }

    #[tokio::test]
    async fn test_purge_requires_connection() {
        let driver = RedisDriver::create(DriverContext::default());
        assert!(driver.purge(Some("mail")).await.is_err());
    }

    #[test]
    fn test_ready_score_orders_priority_then_time() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + ChronoDuration::days(365);

        assert!(ready_score(5, t1) < ready_score(0, t0));
        assert!(ready_score(0, t0) < ready_score(0, t1));
        assert!(ready_score(-1, t0) > ready_score(0, t1));
    }

    #[test]
    fn test_schema_requires_host() {
        let errors = RedisDriver::schema().validate(&DriverConfig::new()).unwrap_err();
        assert_eq!(errors, vec!["host is required".to_string()]);

        let config: DriverConfig =
            serde_json::from_value(json!({"host": "cache", "port": 99999, "prefix": "a b"})).unwrap();
        assert_eq!(RedisDriver::schema().validate(&config).unwrap_err().len(), 2);
    }

    #[tokio::test]
    async fn test_initialize_builds_pool_lazily() {
        let mut driver = RedisDriver::create(DriverContext::default());
        let config: DriverConfig =
            serde_json::from_value(json!({"host": "127.0.0.1", "prefix": "t"})).unwrap();
        driver.initialize(&config).await.unwrap();
        assert!(driver.pool.is_some());
        assert_eq!(driver.keys.ready("default"), "t:queue:default");
    }

    #[tokio::test]
    async fn test_uninitialized_health_is_unknown() {
        let driver = RedisDriver::create(DriverContext::default());
        assert!(!driver.health_check().await.is_operational());
    }
}
