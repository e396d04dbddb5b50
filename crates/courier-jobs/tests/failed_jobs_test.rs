//! Failed-job tracking: logging, retry limits, retention and analytics.

mod common;

use common::{test_config, TestQueue};
use courier_jobs::{ExportFormat, FailedJobFilters, JobFailure, NewJob, ProcessOutcome};
use serde_json::json;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Runs one job of `job_class` that fails on its only attempt and returns
/// the failure record's uuid.
async fn fail_once(queue: &TestQueue, job_class: &str) -> String {
    queue.clock.advance(Duration::from_secs(1));
    queue
        .ctx
        .dispatch(NewJob::new(job_class, json!({"id": 1})).max_attempts(1), None)
        .await
        .unwrap();
    let worker = queue.ctx.worker(None).await.unwrap();
    assert!(matches!(worker.process_next().await.unwrap(), ProcessOutcome::Failed(_)));

    let filters = FailedJobFilters::new().job_class(job_class);
    queue.ctx.failed().list(&filters, Some(1), 0).await.unwrap()[0].uuid.clone()
}

fn queue_with_max_retries(max_retries: u32) -> TestQueue {
    let mut config = test_config();
    config.failed.max_retries = max_retries;
    let queue = TestQueue::with_config(config);
    queue
        .ctx
        .handlers()
        .register_fn("Sync", |_| async { Err(JobFailure::transient("TimeoutException", "slow")) });
    queue
}

#[tokio::test]
async fn test_retry_requeues_until_limit() {
    let queue = queue_with_max_retries(2);
    let uuid = fail_once(&queue, "Sync").await;
    let driver = queue.driver().await;

    assert!(queue.ctx.failed().retry(&uuid).await);
    assert!(queue.ctx.failed().retry(&uuid).await);
    assert_eq!(driver.size(None).await.unwrap(), 2);

    assert!(!queue.ctx.failed().retry(&uuid).await);
    let record = queue.ctx.failed().find(&uuid).await.unwrap().unwrap();
    assert_eq!(record.retry_count, 2);
    assert!(record.last_retry_at.is_some());
    assert!(record.requeued_at.is_some());
    assert_eq!(driver.size(None).await.unwrap(), 2);
}

#[tokio::test]
async fn test_retry_unknown_record_is_false() {
    let queue = queue_with_max_retries(3);
    assert!(!queue.ctx.failed().retry("missing").await);
}

#[tokio::test]
async fn test_retry_all_only_touches_matching_records() {
    let queue = queue_with_max_retries(3);
    queue
        .ctx
        .handlers()
        .register_fn("Other", |_| async { Err(JobFailure::transient("IOException", "disk")) });
    let first = fail_once(&queue, "Sync").await;
    let second = fail_once(&queue, "Sync").await;
    let other = fail_once(&queue, "Other").await;

    let results = queue
        .ctx
        .failed()
        .retry_all(&FailedJobFilters::new().job_class("Sync"))
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results.get(&first), Some(&true));
    assert_eq!(results.get(&second), Some(&true));
    assert!(!results.contains_key(&other));
}

#[tokio::test]
async fn test_cleanup_uses_retention_window() {
    let queue = queue_with_max_retries(3);
    let old = fail_once(&queue, "Sync").await;
    queue.clock.advance(DAY * 31);
    let recent = fail_once(&queue, "Sync").await;

    assert!(queue.ctx.failed().cleanup(None).await);
    assert!(queue.ctx.failed().find(&old).await.unwrap().is_none());
    assert!(queue.ctx.failed().find(&recent).await.unwrap().is_some());

    queue.clock.advance(DAY * 2);
    assert!(queue.ctx.failed().cleanup(Some(1)).await);
    assert_eq!(queue.ctx.failed().count(&FailedJobFilters::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_stats_and_patterns() {
    let queue = TestQueue::new();
    let provider = queue.ctx.failed();
    for _ in 0..10 {
        provider.log("local", "default", "{}", &JobFailure::transient("A", "first")).await;
    }
    for _ in 0..5 {
        provider.log("local", "default", "{}", &JobFailure::permanent("B", "second")).await;
    }

    let stats = provider.stats(&FailedJobFilters::new()).await.unwrap();
    assert_eq!(stats.total, 15);
    assert_eq!(stats.retryable, 10);
    assert_eq!(stats.non_retryable, 5);
    assert_eq!(stats.last_24h, 15);

    let patterns = provider.failure_patterns().await.unwrap();
    let types: Vec<(&str, u64)> = patterns
        .exception_types
        .iter()
        .map(|p| (p.name.as_str(), p.count))
        .collect();
    assert_eq!(types, vec![("A", 10), ("B", 5)]);
    assert_eq!(patterns.job_classes[0].name, "unknown");
    assert_eq!(patterns.hourly.len(), 1);
    assert_eq!(patterns.hourly[0].count, 15);
}

#[tokio::test]
async fn test_export_csv_quotes_fields() {
    let queue = TestQueue::new();
    queue
        .ctx
        .failed()
        .log("local", "default", "{}", &JobFailure::permanent("ValueError", "bad \"input\", again"))
        .await;

    let csv = queue
        .ctx
        .failed()
        .export(&FailedJobFilters::new(), ExportFormat::Csv)
        .await
        .unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("uuid,connection,queue"));
    assert!(lines[1].contains("\"bad \"\"input\"\", again\""));

    let json = queue
        .ctx
        .failed()
        .export(&FailedJobFilters::new(), ExportFormat::Json)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed[0]["exception_class"], "ValueError");
}
