//! MySQL failure store.

use super::{
    FailedJobFilters, FailedJobRecord, FailedJobStats, FailedJobStore, FailurePatterns, HourlyCount,
    PatternCount,
};
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::MySqlPool;
use shaku::Component;
use sqlx::{FromRow, MySql, QueryBuilder};
use tracing::debug;

const COLUMNS: &str = "uuid, `connection`, queue, payload, exception_class, exception_message, \
     exception_trace, failed_at, retry_count, retryable, job_class, job_uuid, attempts, \
     last_retry_at, requeued_at";

/// Failure store over the `queue_failed_jobs` table.
#[derive(Clone, Component)]
#[shaku(interface = FailedJobStore)]
pub struct MySqlFailedJobStore {
    pool: MySqlPool,
}

impl MySqlFailedJobStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

/// Database row representation of a failure record.
#[derive(Debug, FromRow)]
struct FailedJobRow {
    uuid: String,
    connection: String,
    queue: String,
    payload: String,
    exception_class: String,
    exception_message: String,
    exception_trace: Option<String>,
    failed_at: DateTime<Utc>,
    retry_count: u32,
    retryable: bool,
    job_class: String,
    job_uuid: Option<String>,
    attempts: u32,
    last_retry_at: Option<DateTime<Utc>>,
    requeued_at: Option<DateTime<Utc>>,
}

impl From<FailedJobRow> for FailedJobRecord {
    fn from(row: FailedJobRow) -> Self {
        Self {
            uuid: row.uuid,
            connection: row.connection,
            queue: row.queue,
            payload: row.payload,
            exception_class: row.exception_class,
            exception_message: row.exception_message,
            exception_trace: row.exception_trace,
            failed_at: row.failed_at,
            retry_count: row.retry_count,
            retryable: row.retryable,
            job_class: row.job_class,
            job_uuid: row.job_uuid,
            attempts: row.attempts,
            last_retry_at: row.last_retry_at,
            requeued_at: row.requeued_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct StatsRow {
    total: i64,
    retryable: i64,
    recent: i64,
}

#[derive(Debug, FromRow)]
struct GroupRow {
    name: String,
    count: i64,
}

#[derive(Debug, FromRow)]
struct HourRow {
    hour: String,
    count: i64,
}

/// Appends ` WHERE ...` for every set filter.
fn push_filters(builder: &mut QueryBuilder<'_, MySql>, filters: &FailedJobFilters) {
    builder.push(" WHERE 1 = 1");
    let text_filters = [
        ("`connection`", &filters.connection),
        ("queue", &filters.queue),
        ("job_class", &filters.job_class),
        ("exception_class", &filters.exception_class),
    ];
    for (column, value) in text_filters {
        if let Some(value) = value {
            builder.push(format!(" AND {column} = ")).push_bind(value.clone());
        }
    }
    if let Some(retryable) = filters.retryable {
        builder.push(" AND retryable = ").push_bind(retryable);
    }
    if let Some(after) = filters.failed_after {
        builder.push(" AND failed_at >= ").push_bind(after);
    }
    if let Some(before) = filters.failed_before {
        builder.push(" AND failed_at <= ").push_bind(before);
    }
}

fn top_sql(column: &str) -> String {
    format!(
        "SELECT {column} AS name, COUNT(*) AS count FROM queue_failed_jobs \
         GROUP BY {column} ORDER BY count DESC, name ASC LIMIT ?"
    )
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_hour(hour: &str) -> JobResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(hour, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| JobError::Internal(format!("Invalid hour bucket '{hour}': {e}")))
}

#[async_trait]
impl FailedJobStore for MySqlFailedJobStore {
    async fn insert(&self, record: &FailedJobRecord) -> JobResult<()> {
        sqlx::query(&format!(
            "INSERT INTO queue_failed_jobs ({COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&record.uuid)
        .bind(&record.connection)
        .bind(&record.queue)
        .bind(&record.payload)
        .bind(&record.exception_class)
        .bind(&record.exception_message)
        .bind(&record.exception_trace)
        .bind(record.failed_at)
        .bind(record.retry_count)
        .bind(record.retryable)
        .bind(&record.job_class)
        .bind(&record.job_uuid)
        .bind(record.attempts)
        .bind(record.last_retry_at)
        .bind(record.requeued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, uuid: &str) -> JobResult<Option<FailedJobRecord>> {
        let row = sqlx::query_as::<_, FailedJobRow>(&format!(
            "SELECT {COLUMNS} FROM queue_failed_jobs WHERE uuid = ?"
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FailedJobRecord::from))
    }

    async fn list(
        &self,
        filters: &FailedJobFilters,
        limit: Option<u64>,
        offset: u64,
    ) -> JobResult<Vec<FailedJobRecord>> {
        let mut builder: QueryBuilder<MySql> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM queue_failed_jobs"));
        push_filters(&mut builder, filters);
        builder.push(" ORDER BY failed_at DESC, uuid ASC");
        // MySQL has no OFFSET without LIMIT.
        builder.push(" LIMIT ").push_bind(limit.unwrap_or(u64::MAX));
        builder.push(" OFFSET ").push_bind(offset);

        let rows = builder
            .build_query_as::<FailedJobRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(FailedJobRecord::from).collect())
    }

    async fn count(&self, filters: &FailedJobFilters) -> JobResult<u64> {
        let mut builder: QueryBuilder<MySql> = QueryBuilder::new("SELECT COUNT(*) FROM queue_failed_jobs");
        push_filters(&mut builder, filters);
        let (count,): (i64,) = builder.build_query_as().fetch_one(&self.pool).await?;
        Ok(to_count(count))
    }

    async fn delete(&self, uuid: &str) -> JobResult<bool> {
        let result = sqlx::query("DELETE FROM queue_failed_jobs WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn flush(&self) -> JobResult<u64> {
        let result = sqlx::query("DELETE FROM queue_failed_jobs")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn mark_retried(&self, uuid: &str, max_retries: u32, at: DateTime<Utc>) -> JobResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_failed_jobs
            SET retry_count = retry_count + 1, last_retry_at = ?
            WHERE uuid = ? AND retry_count < ?
            "#,
        )
        .bind(at)
        .bind(uuid)
        .bind(max_retries)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revert_retried(&self, uuid: &str, previous_retry_at: Option<DateTime<Utc>>) -> JobResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_failed_jobs
            SET retry_count = retry_count - 1, last_retry_at = ?
            WHERE uuid = ? AND retry_count > 0
            "#,
        )
        .bind(previous_retry_at)
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_requeued(&self, uuid: &str, at: DateTime<Utc>) -> JobResult<()> {
        sqlx::query("UPDATE queue_failed_jobs SET requeued_at = ? WHERE uuid = ?")
            .bind(at)
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> JobResult<u64> {
        let result = sqlx::query("DELETE FROM queue_failed_jobs WHERE failed_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        debug!(removed = result.rows_affected(), "Deleted expired failure records");
        Ok(result.rows_affected())
    }

    async fn stats(&self, filters: &FailedJobFilters, recent_since: DateTime<Utc>) -> JobResult<FailedJobStats> {
        let mut builder: QueryBuilder<MySql> = QueryBuilder::new(
            "SELECT COUNT(*) AS total, \
             CAST(COALESCE(SUM(retryable), 0) AS SIGNED) AS retryable, \
             CAST(COALESCE(SUM(failed_at >= ",
        );
        builder.push_bind(recent_since);
        builder.push("), 0) AS SIGNED) AS recent FROM queue_failed_jobs");
        push_filters(&mut builder, filters);

        let row = builder.build_query_as::<StatsRow>().fetch_one(&self.pool).await?;
        let total = to_count(row.total);
        let retryable = to_count(row.retryable);
        Ok(FailedJobStats {
            total,
            retryable,
            non_retryable: total.saturating_sub(retryable),
            last_24h: to_count(row.recent),
        })
    }

    async fn patterns(&self, top: usize, hourly_since: DateTime<Utc>) -> JobResult<FailurePatterns> {
        let top = u64::try_from(top).unwrap_or(u64::MAX);

        let mut groups = Vec::with_capacity(2);
        for column in ["exception_class", "job_class"] {
            let rows = sqlx::query_as::<_, GroupRow>(&top_sql(column))
                .bind(top)
                .fetch_all(&self.pool)
                .await?;
            groups.push(
                rows.into_iter()
                    .map(|r| PatternCount {
                        name: r.name,
                        count: to_count(r.count),
                    })
                    .collect::<Vec<_>>(),
            );
        }
        let job_classes = groups.pop().unwrap_or_default();
        let exception_types = groups.pop().unwrap_or_default();

        let hours = sqlx::query_as::<_, HourRow>(
            r#"
            SELECT DATE_FORMAT(failed_at, '%Y-%m-%d %H:00:00') AS hour, COUNT(*) AS count
            FROM queue_failed_jobs
            WHERE failed_at >= ?
            GROUP BY hour
            ORDER BY hour ASC
            "#,
        )
        .bind(hourly_since)
        .fetch_all(&self.pool)
        .await?;

        let hourly = hours
            .into_iter()
            .map(|r| {
                Ok(HourlyCount {
                    hour: parse_hour(&r.hour)?,
                    count: to_count(r.count),
                })
            })
            .collect::<JobResult<Vec<_>>>()?;

        Ok(FailurePatterns {
            exception_types,
            job_classes,
            hourly,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_filters_render_binds_in_order() {
        let filters = FailedJobFilters::new().queue("emails").retryable(false);
        let mut builder: QueryBuilder<MySql> = QueryBuilder::new("SELECT 1 FROM queue_failed_jobs");
        push_filters(&mut builder, &filters);
        assert_eq!(
            builder.sql(),
            "SELECT 1 FROM queue_failed_jobs WHERE 1 = 1 AND queue = ? AND retryable = ?"
        );
    }

    #[test]
    fn test_top_sql_groups_by_column() {
        let sql = top_sql("job_class");
        assert!(sql.contains("GROUP BY job_class"));
        assert!(sql.ends_with("LIMIT ?"));
    }

    #[test]
    fn test_parse_hour() {
        assert_eq!(
            parse_hour("2024-01-01 10:00:00").unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );
        assert!(parse_hour("yesterday").is_err());
    }
}
