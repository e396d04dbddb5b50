//! MySQL schedule store over `scheduled_jobs` and `job_executions`.

use super::store::{ExecutionStatus, JobExecution, ScheduleStore, ScheduledJob};
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shaku::Component;
use sqlx::mysql::MySqlPool;
use sqlx::FromRow;

const JOB_COLUMNS: &str =
    "uuid, name, schedule, handler_class, parameters, is_enabled, last_run, next_run";
const EXECUTION_COLUMNS: &str = "uuid, job_uuid, status, started_at, completed_at, result";

/// Persistent schedule store.
#[derive(Clone, Component)]
#[shaku(interface = ScheduleStore)]
pub struct MySqlScheduleStore {
    pool: MySqlPool,
}

impl MySqlScheduleStore {
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ScheduledJobRow {
    uuid: String,
    name: String,
    schedule: String,
    handler_class: String,
    parameters: Option<String>,
    is_enabled: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

impl TryFrom<ScheduledJobRow> for ScheduledJob {
    type Error = JobError;

    fn try_from(row: ScheduledJobRow) -> Result<Self, Self::Error> {
        let parameters = match row.parameters.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => serde_json::Value::Null,
        };

        Ok(ScheduledJob {
            uuid: row.uuid,
            name: row.name,
            schedule: row.schedule,
            handler_class: row.handler_class,
            parameters,
            enabled: row.is_enabled,
            last_run: row.last_run,
            next_run: row.next_run,
            persistent: true,
        })
    }
}

#[derive(Debug, FromRow)]
struct JobExecutionRow {
    uuid: String,
    job_uuid: String,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<String>,
}

impl TryFrom<JobExecutionRow> for JobExecution {
    type Error = JobError;

    fn try_from(row: JobExecutionRow) -> Result<Self, Self::Error> {
        Ok(JobExecution {
            status: row.status.parse()?,
            uuid: row.uuid,
            job_uuid: row.job_uuid,
            started_at: row.started_at,
            completed_at: row.completed_at,
            result: row.result,
        })
    }
}

#[async_trait]
impl ScheduleStore for MySqlScheduleStore {
    async fn insert_job(&self, job: &ScheduledJob) -> JobResult<()> {
        sqlx::query(&format!(
            "INSERT INTO scheduled_jobs ({JOB_COLUMNS}, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&job.uuid)
        .bind(&job.name)
        .bind(&job.schedule)
        .bind(&job.handler_class)
        .bind(serde_json::to_string(&job.parameters)?)
        .bind(job.enabled)
        .bind(job.last_run)
        .bind(job.next_run)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn jobs(&self) -> JobResult<Vec<ScheduledJob>> {
        let rows = sqlx::query_as::<_, ScheduledJobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs ORDER BY name ASC, uuid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ScheduledJob::try_from).collect()
    }

    async fn find_job(&self, uuid: &str) -> JobResult<Option<ScheduledJob>> {
        let row = sqlx::query_as::<_, ScheduledJobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE uuid = ?"
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ScheduledJob::try_from).transpose()
    }

    async fn find_job_by_name(&self, name: &str) -> JobResult<Option<ScheduledJob>> {
        let row = sqlx::query_as::<_, ScheduledJobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE name = ? ORDER BY uuid LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ScheduledJob::try_from).transpose()
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> JobResult<bool> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scheduled_jobs WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        sqlx::query("UPDATE scheduled_jobs SET is_enabled = ? WHERE name = ?")
            .bind(enabled)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn delete_job(&self, name: &str) -> JobResult<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE e FROM job_executions e
            JOIN scheduled_jobs j ON j.uuid = e.job_uuid
            WHERE j.name = ?
            "#,
        )
        .bind(name)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_run(
        &self,
        uuid: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> JobResult<()> {
        sqlx::query("UPDATE scheduled_jobs SET last_run = ?, next_run = ? WHERE uuid = ?")
            .bind(last_run)
            .bind(next_run)
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_execution(&self, execution: &JobExecution) -> JobResult<()> {
        sqlx::query(&format!(
            "INSERT INTO job_executions ({EXECUTION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(&execution.uuid)
        .bind(&execution.job_uuid)
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(&execution.result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_execution(
        &self,
        uuid: &str,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        result: Option<String>,
    ) -> JobResult<()> {
        sqlx::query("UPDATE job_executions SET status = ?, completed_at = ?, result = ? WHERE uuid = ?")
            .bind(status.as_str())
            .bind(completed_at)
            .bind(result)
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn executions(&self, job_uuid: &str, limit: u64) -> JobResult<Vec<JobExecution>> {
        let rows = sqlx::query_as::<_, JobExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions \
             WHERE job_uuid = ? ORDER BY started_at DESC LIMIT ?"
        ))
        .bind(job_uuid)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobExecution::try_from).collect()
    }
}
