//! Scheduler runs against the manual clock.

mod common;

use chrono::{TimeZone, Utc};
use common::TestQueue;
use courier_jobs::{CronExpression, ExecutionStatus, JobFailure};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_hourly_cron_next_run() {
    let cron = CronExpression::parse("0 * * * *").unwrap();
    let at = Utc.with_ymd_and_hms(2024, 6, 3, 10, 15, 0).unwrap();
    assert_eq!(
        cron.next_after(at),
        Some(Utc.with_ymd_and_hms(2024, 6, 3, 11, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_in_process_task_runs_once_per_due_minute() {
    let queue = TestQueue::new();
    let scheduler = queue.ctx.scheduler();
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = Arc::clone(&runs);
        scheduler
            .register_fn(
                "0 * * * *",
                move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async { Ok(Value::Null) }
                },
                "hourly-digest",
            )
            .unwrap();
    }

    assert!(scheduler.run_due_jobs().await.is_empty());
    let listed = scheduler.list().await.unwrap();
    assert_eq!(
        listed[0].next_run,
        Some(Utc.with_ymd_and_hms(2024, 6, 3, 11, 0, 0).unwrap())
    );

    queue.clock.set(Utc.with_ymd_and_hms(2024, 6, 3, 11, 0, 20).unwrap());
    let reports = scheduler.run_due_jobs().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, ExecutionStatus::Completed);
    assert!(scheduler.run_due_jobs().await.is_empty());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let listed = scheduler.list().await.unwrap();
    assert_eq!(
        listed[0].next_run,
        Some(Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_persistent_job_records_executions() {
    let queue = TestQueue::new();
    queue
        .ctx
        .tasks()
        .register_fn("PruneLogs", |params| async move {
            let days = params["days"].clone();
            Ok(json!({ "pruned_days": days }))
        });
    let scheduler = queue.ctx.scheduler();
    let uuid = scheduler
        .register_in_database("prune-logs", "*/5 * * * *", "PruneLogs", json!({"days": 30}))
        .await
        .unwrap();

    let reports = scheduler.run_due_jobs().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].job_uuid, uuid);
    assert_eq!(reports[0].output, Some(json!({"pruned_days": 30})));
    assert!(scheduler.run_due_jobs().await.is_empty());

    let executions = scheduler.executions(&uuid, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
    assert!(executions[0].completed_at.is_some());

    let job = scheduler.list().await.unwrap().into_iter().find(|j| j.uuid == uuid).unwrap();
    assert_eq!(job.last_run, Some(Utc.with_ymd_and_hms(2024, 6, 3, 10, 15, 0).unwrap()));
    assert_eq!(job.next_run, Some(Utc.with_ymd_and_hms(2024, 6, 3, 10, 20, 0).unwrap()));
}

#[tokio::test]
async fn test_failing_task_does_not_stop_others() {
    let queue = TestQueue::new();
    let scheduler = queue.ctx.scheduler();
    scheduler
        .register_fn("* * * * *", |_| async { Err(JobFailure::permanent("RuntimeException", "boom")) }, "a-broken")
        .unwrap();
    scheduler
        .register_fn("* * * * *", |_| async { Ok(json!("ok")) }, "b-healthy")
        .unwrap();

    let reports = scheduler.run_all_jobs().await;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].name, "a-broken");
    assert_eq!(reports[0].status, ExecutionStatus::Failed);
    assert!(reports[0].error.as_deref().unwrap().contains("boom"));
    assert_eq!(reports[1].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_disabled_job_is_not_run() {
    let queue = TestQueue::new();
    let scheduler = queue.ctx.scheduler();
    scheduler
        .register_fn("* * * * *", |_| async { Ok(Value::Null) }, "noisy")
        .unwrap();

    assert!(scheduler.disable("noisy").await.unwrap());
    assert!(scheduler.run_all_jobs().await.is_empty());
    assert!(scheduler.enable("noisy").await.unwrap());
    assert_eq!(scheduler.run_all_jobs().await.len(), 1);
    assert!(!scheduler.disable("missing").await.unwrap());
}
