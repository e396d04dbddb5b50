//! MySQL table-backed queue driver.
//!
//! `pop` selects the next visible row with `FOR UPDATE SKIP LOCKED` and marks
//! it reserved inside one transaction, so concurrent workers skip each
//! other's rows instead of blocking. Jobs are served by priority (highest
//! first), then by insertion id. Bulk pushes insert row by row, so one bad
//! row does not take the rest of the batch down with it.

use super::{
    report_failure, string_option, CommonOptions, ConfigSchema, DriverConfig, DriverContext,
    DriverInfo, DriverStats, FieldSpec, FieldType, HealthStatus, NewJob, QueueDriver,
    RegisteredDriver,
};
use crate::error::{JobError, JobResult};
use crate::failure::JobFailure;
use crate::job::{Job, JobId};
use crate::metrics::JobMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::{FromRow, MySql, QueryBuilder};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_TABLE: &str = "queue_jobs";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const JOB_COLUMNS: &str = "uuid, queue, job_class, payload, attempts, max_attempts, \
     timeout_seconds, priority, batch_uuid, available_at, reserved_at, created_at";

/// Database row representation of a queued job.
#[derive(Debug, FromRow)]
struct QueueJobRow {
    id: u64,
    uuid: String,
    queue: String,
    job_class: String,
    payload: String,
    attempts: u32,
    max_attempts: u32,
    timeout_seconds: u32,
    priority: i32,
    batch_uuid: Option<String>,
    available_at: DateTime<Utc>,
    reserved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<QueueJobRow> for Job {
    type Error = JobError;

    fn try_from(row: QueueJobRow) -> Result<Self, Self::Error> {
        let data: Value = serde_json::from_str(&row.payload)
            .map_err(|e| JobError::InvalidPayload(format!("Row {} has invalid payload: {e}", row.id)))?;

        Ok(Job {
            id: JobId::from(row.uuid),
            queue: row.queue,
            job_class: row.job_class,
            data,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            timeout_seconds: u64::from(row.timeout_seconds),
            priority: row.priority,
            batch_uuid: row.batch_uuid,
            created_at: row.created_at,
            available_at: row.available_at,
            reserved_at: row.reserved_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct QueueStatsRow {
    total: i64,
    pending: i64,
    delayed: i64,
    reserved: i64,
    oldest: Option<DateTime<Utc>>,
}

fn is_identifier(value: &Value) -> Result<(), String> {
    let valid = value.as_str().is_some_and(|s| {
        !s.is_empty() && s.len() <= 64 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    });
    if valid {
        Ok(())
    } else {
        Err("must contain only letters, digits and underscores".to_string())
    }
}

fn pop_sql(table: &str) -> String {
    format!(
        "SELECT id, {JOB_COLUMNS} FROM {table} \
         WHERE queue = ? AND ( \
             (reserved_at IS NULL AND available_at <= ?) \
             OR (reserved_at IS NOT NULL \
                 AND reserved_at <= DATE_SUB(?, INTERVAL (timeout_seconds + ?) SECOND)) \
         ) \
         ORDER BY priority DESC, id ASC \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED"
    )
}

fn insert_sql(table: &str) -> String {
    format!("INSERT INTO {table} ({JOB_COLUMNS}) ")
}

fn stats_sql(table: &str) -> String {
    format!(
        "SELECT COUNT(*) AS total, \
             CAST(COALESCE(SUM(reserved_at IS NULL AND available_at <= ?), 0) AS SIGNED) AS pending, \
             CAST(COALESCE(SUM(reserved_at IS NULL AND available_at > ?), 0) AS SIGNED) AS delayed, \
             CAST(COALESCE(SUM(reserved_at IS NOT NULL), 0) AS SIGNED) AS reserved, \
             MIN(created_at) AS oldest \
         FROM {table} WHERE queue = ?"
    )
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero())
}

/// MySQL queue driver.
pub struct DatabaseDriver {
    options: CommonOptions,
    table: String,
    pool: Option<MySqlPool>,
    ctx: DriverContext,
}

impl DatabaseDriver {
    /// Creates a driver over an existing pool.
    pub fn with_pool(pool: MySqlPool, ctx: DriverContext) -> Self {
        Self {
            pool: Some(pool),
            ..Self::create(ctx)
        }
    }

    fn pool(&self) -> JobResult<&MySqlPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| JobError::Configuration("Database driver is not initialized".into()))
    }

    async fn insert(&self, job: &Job) -> JobResult<()> {
        let payload = serde_json::to_string(&job.data)?;
        let mut builder: QueryBuilder<MySql> = QueryBuilder::new(insert_sql(&self.table));
        builder.push_values(std::iter::once(job), |mut row, job| {
            push_job_binds(&mut row, job, &payload);
        });
        builder.build().execute(self.pool()?).await?;
        Ok(())
    }
}

fn push_job_binds<'q>(
    row: &mut sqlx::query_builder::Separated<'_, 'q, MySql, &'static str>,
    job: &'q Job,
    payload: &'q str,
) {
    row.push_bind(job.id.as_str())
        .push_bind(job.queue.as_str())
        .push_bind(job.job_class.as_str())
        .push_bind(payload)
        .push_bind(job.attempts)
        .push_bind(job.max_attempts)
        .push_bind(u32::try_from(job.timeout_seconds).unwrap_or(u32::MAX))
        .push_bind(job.priority)
        .push_bind(job.batch_uuid.as_deref())
        .push_bind(job.available_at)
        .push_bind(job.reserved_at)
        .push_bind(job.created_at);
}

impl RegisteredDriver for DatabaseDriver {
    const NAME: &'static str = "database";

    fn driver_info() -> DriverInfo {
        DriverInfo::new(Self::NAME, env!("CARGO_PKG_VERSION"))
            .author("Courier Team")
            .description("MySQL table queue with row-level locking")
            .features(["delayed", "priority", "bulk", "purge", "stats", "persistent"])
            .dependency("mysql", ">=8.0")
    }

    fn schema() -> ConfigSchema {
        CommonOptions::schema()
            .field("host", FieldSpec::required(FieldType::String).description("MySQL host"))
            .field(
                "port",
                FieldSpec::optional(FieldType::Port).default_value(3306),
            )
            .field("database", FieldSpec::required(FieldType::String).validator(is_identifier))
            .field("username", FieldSpec::optional(FieldType::String))
            .field("password", FieldSpec::optional(FieldType::String))
            .field(
                "table",
                FieldSpec::optional(FieldType::String)
                    .default_value(DEFAULT_TABLE)
                    .validator(is_identifier),
            )
            .field(
                "max_connections",
                FieldSpec::optional(FieldType::Int).default_value(10),
            )
    }

    fn create(ctx: DriverContext) -> Self {
        Self {
            options: CommonOptions::new(Self::NAME),
            table: DEFAULT_TABLE.to_string(),
            pool: None,
            ctx,
        }
    }
}

#[async_trait]
impl QueueDriver for DatabaseDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn initialize(&mut self, config: &DriverConfig) -> JobResult<()> {
        self.options = CommonOptions::read(Self::NAME, config);
        self.table = string_option(config, "table").unwrap_or_else(|| DEFAULT_TABLE.to_string());

        if self.pool.is_some() {
            return Ok(());
        }

        let host = string_option(config, "host")
            .ok_or_else(|| JobError::invalid_configuration(Self::NAME, vec!["host is required".into()]))?;
        let database = string_option(config, "database").ok_or_else(|| {
            JobError::invalid_configuration(Self::NAME, vec!["database is required".into()])
        })?;
        let port = config
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(3306);
        let max_connections = config
            .get("max_connections")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(10);

        let mut connect = MySqlConnectOptions::new()
            .host(&host)
            .port(port)
            .database(&database);
        if let Some(username) = string_option(config, "username") {
            connect = connect.username(&username);
        }
        if let Some(password) = string_option(config, "password") {
            connect = connect.password(&password);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(connect);

        info!(
            driver = Self::NAME,
            host = %host,
            database = %database,
            table = %self.table,
            "Database queue driver initialized"
        );
        self.pool = Some(pool);
        Ok(())
    }

    async fn enqueue(&self, job: NewJob) -> JobResult<JobId> {
        job.validate()?;
        let job = job.into_job(&self.options.queue, self.ctx.clock.now());
        self.insert(&job).await?;
        JobMetrics::job_pushed(&job.queue, &job.job_class);
        debug!(job_id = %job.id, queue = %job.queue, "Pushed job");
        Ok(job.id)
    }

    async fn pop(&self, queue: Option<&str>) -> JobResult<Option<Job>> {
        let queue = self.options.queue_or_default(queue);
        let now = self.ctx.clock.now();
        let mut tx = self.pool()?.begin().await?;

        let row = sqlx::query_as::<_, QueueJobRow>(&pop_sql(&self.table))
            .bind(queue)
            .bind(now)
            .bind(now)
            .bind(self.options.retry_after)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query(&format!("UPDATE {} SET reserved_at = ? WHERE id = ?", self.table))
            .bind(now)
            .bind(row.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut job = Job::try_from(row)?;
        job.reserved_at = Some(now);
        Ok(Some(job))
    }

    async fn release(&self, job: &Job, delay: Duration) -> JobResult<()> {
        let available_at = after(self.ctx.clock.now(), delay);
        let result = sqlx::query(&format!(
            "UPDATE {} SET attempts = ?, reserved_at = NULL, available_at = ? WHERE uuid = ?",
            self.table
        ))
        .bind(job.attempts)
        .bind(available_at)
        .bind(job.id.as_str())
        .execute(self.pool()?)
        .await?;

        if result.rows_affected() == 0 {
            let mut restored = job.clone();
            restored.reserved_at = None;
            restored.available_at = available_at;
            self.insert(&restored).await?;
        }
        Ok(())
    }

    async fn delete(&self, job: &Job) -> JobResult<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE uuid = ?", self.table))
            .bind(job.id.as_str())
            .execute(self.pool()?)
            .await?;
        Ok(())
    }

    async fn size(&self, queue: Option<&str>) -> JobResult<u64> {
        let queue = self.options.queue_or_default(queue);
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE queue = ?",
            self.table
        ))
        .bind(queue)
        .fetch_one(self.pool()?)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn purge(&self, queue: Option<&str>) -> JobResult<u64> {
        let queue = self.options.queue_or_default(queue);
        let result = sqlx::query(&format!("DELETE FROM {} WHERE queue = ?", self.table))
            .bind(queue)
            .execute(self.pool()?)
            .await?;
        info!(queue = %queue, purged = result.rows_affected(), "Purged queue");
        Ok(result.rows_affected())
    }

    async fn stats(&self, queue: Option<&str>) -> JobResult<DriverStats> {
        let queue = self.options.queue_or_default(queue);
        let now = self.ctx.clock.now();
        let row = sqlx::query_as::<_, QueueStatsRow>(&stats_sql(&self.table))
            .bind(now)
            .bind(now)
            .bind(queue)
            .fetch_one(self.pool()?)
            .await?;

        let mut stats = DriverStats::new();
        stats.insert("queue".into(), Value::from(queue));
        stats.insert("table".into(), Value::from(self.table.as_str()));
        stats.insert("size".into(), Value::from(row.total));
        stats.insert("pending".into(), Value::from(row.pending));
        stats.insert("delayed".into(), Value::from(row.delayed));
        stats.insert("reserved".into(), Value::from(row.reserved));
        stats.insert(
            "oldest_job_age_secs".into(),
            row.oldest
                .map_or(Value::Null, |o| Value::from((now - o).num_seconds().max(0))),
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
        let Ok(pool) = self.pool() else {
            return HealthStatus::unknown("Database driver is not initialized");
        };

        let started = Instant::now();
        let probe = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool);
        match tokio::time::timeout(HEALTH_TIMEOUT, probe).await {
            Ok(Ok(_)) => HealthStatus::healthy("Database connection OK")
                .with_metric("pool_size", pool.size())
                .with_metric("idle_connections", pool.num_idle())
                .with_response_time(started.elapsed()),
            Ok(Err(e)) => {
                warn!(driver = Self::NAME, error = %e, "Database health check failed");
                HealthStatus::unhealthy(format!("Database query failed: {e}"))
                    .with_response_time(started.elapsed())
            }
            Err(_) => {
                warn!(driver = Self::NAME, "Database health check timed out");
                HealthStatus::unhealthy("Database health check timed out")
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
    use serde_json::json;

    fn config(value: Value) -> DriverConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_pop_sql_locks_and_orders() {
        let sql = pop_sql("queue_jobs");
        assert!(sql.contains("FROM queue_jobs"));
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("ORDER BY priority DESC, id ASC"));
        assert_eq!(sql.matches('?').count(), 4);
    }

    #[test]
    fn test_stats_sql_binds() {
        assert_eq!(stats_sql("jobs").matches('?').count(), 3);
    }

    #[test]
    fn test_schema_requires_host_and_database() {
        let errors = DatabaseDriver::schema().validate(&DriverConfig::new()).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_schema_rejects_unsafe_table_name() {
        let errors = DatabaseDriver::schema()
            .validate(&config(json!({
                "host": "localhost",
                "database": "app",
                "table": "jobs; DROP TABLE users"
            })))
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("table"));
    }

    #[test]
    fn test_row_conversion() {
        let now = Utc::now();
        let row = QueueJobRow {
            id: 7,
            uuid: "job-7".into(),
            queue: "default".into(),
            job_class: "SendEmail".into(),
            payload: r#"{"to":"a@b.c"}"#.into(),
            attempts: 1,
            max_attempts: 3,
            timeout_seconds: 60,
            priority: 2,
            batch_uuid: None,
            available_at: now,
            reserved_at: None,
            created_at: now,
        };
        let job = Job::try_from(row).unwrap();
        assert_eq!(job.id.as_str(), "job-7");
        assert_eq!(job.data["to"], "a@b.c");
        assert_eq!(job.timeout_seconds, 60);
    }

    #[tokio::test]
    async fn test_bulk_reports_each_entry() {
        let driver = DatabaseDriver::create(DriverContext::default());
        let result = driver
            .bulk(
                vec![NewJob::new("", json!({})), NewJob::new("SendEmail", json!({"id": 1}))],
                Some("mail"),
            )
            .await
            .unwrap();
        assert_eq!(result.ids, vec![None, None]);
        assert_eq!(result.failed_indices(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_uninitialized_driver_health_is_unknown() {
        let driver = DatabaseDriver::create(DriverContext::default());
        let health = driver.health_check().await;
        assert_eq!(health.status, super::super::HealthState::Unknown);
    }
}
