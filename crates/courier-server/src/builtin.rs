//! Maintenance tasks available to every deployment.

use courier_jobs::{JobFailure, QueueContext};
use serde_json::{json, Value};
use std::sync::Arc;

/// Deletes failure records past retention. Parameter `days` overrides the
/// configured window.
pub const PRUNE_FAILED_JOBS: &str = "courier.prune_failed_jobs";

/// Records the health of every cached driver instance.
pub const DRIVER_HEALTH: &str = "courier.driver_health";

/// Registers the built-in task handlers.
pub fn register_builtin_tasks(ctx: &QueueContext) {
    let failed = Arc::clone(ctx.failed());
    ctx.tasks().register_fn(PRUNE_FAILED_JOBS, move |params: Value| {
        let failed = Arc::clone(&failed);
        async move {
            let days = params
                .get("days")
                .and_then(Value::as_u64)
                .and_then(|d| u32::try_from(d).ok());
            if failed.cleanup(days).await {
                Ok(json!({ "days": days }))
            } else {
                Err(JobFailure::transient("CleanupFailed", "Failed job store rejected the cleanup"))
            }
        }
    });

    let registry = Arc::clone(ctx.registry());
    ctx.tasks().register_fn(DRIVER_HEALTH, move |_| {
        let registry = Arc::clone(&registry);
        async move {
            let health = registry.health_check_all().await;
            let unhealthy: Vec<&String> = health
                .iter()
                .filter(|(_, status)| !status.is_operational())
                .map(|(key, _)| key)
                .collect();
            if unhealthy.is_empty() {
                Ok(json!({ "checked": health.len() }))
            } else {
                Err(JobFailure::transient(
                    "DriverUnhealthy",
                    format!("Unhealthy drivers: {unhealthy:?}"),
                ))
            }
        }
    });
}
