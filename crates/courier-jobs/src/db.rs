//! Connection pools and schema migrations.

use crate::error::{JobError, JobResult};
use courier_config::{DatabaseConfig, RedisConfig};
use deadpool_redis::{Config, Pool, Runtime};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use tracing::{info, warn};

/// Opens the MySQL pool used by the failed-job and schedule stores.
pub async fn create_mysql_pool(config: &DatabaseConfig) -> JobResult<MySqlPool> {
    info!("Connecting to MySQL database...");

    let pool = MySqlPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(Some(config.idle_timeout()))
        .connect(&config.url)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to connect to database");
            JobError::Database(e)
        })?;

    info!("MySQL connection pool established");
    Ok(pool)
}

/// Creates the `queue_jobs`, `queue_failed_jobs`, `scheduled_jobs` and
/// `job_executions` tables.
pub async fn run_migrations(pool: &MySqlPool) -> JobResult<()> {
    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| JobError::Configuration(format!("Migration failed: {e}")))?;
    info!("Database migrations completed");
    Ok(())
}

/// Creates a Redis pool and checks it with `PING`.
pub async fn create_redis_pool(config: &RedisConfig) -> JobResult<Pool> {
    info!("Creating Redis connection pool...");

    let pool = Config::from_url(&config.url)
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {e}")))?
        .max_size(usize::try_from(config.pool_size).unwrap_or(usize::MAX))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {e}")))?;

    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");
    Ok(pool)
}
