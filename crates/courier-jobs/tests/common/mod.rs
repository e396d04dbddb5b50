//! Shared setup for queue integration tests.
//!
//! Everything runs on in-memory stores with a manual clock, so tests control
//! delays, retention windows and cron minutes directly.

use chrono::{DateTime, TimeZone, Utc};
use courier_jobs::{
    ConnectionConfig, JobsConfig, ManualClock, QueueContext, QueueDriver, QueueStores, RetryStrategy,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Delay between attempts in these tests.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Monday 2024-06-03 10:15:00 UTC.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 10, 15, 0).unwrap()
}

/// One memory connection named `local`, fixed backoff without jitter.
pub fn test_config() -> JobsConfig {
    let mut config = JobsConfig::default();
    config.default_driver = "local".to_string();
    config.drivers.insert(
        "local".to_string(),
        ConnectionConfig {
            driver: "memory".to_string(),
            options: serde_json::from_value(json!({"queue": "default"})).unwrap(),
        },
    );
    config.retry.strategy = RetryStrategy::Fixed;
    config.retry.initial_delay_ms = 5_000;
    config.retry.jitter = false;
    config
}

pub struct TestQueue {
    pub ctx: QueueContext,
    pub clock: ManualClock,
}

impl TestQueue {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: JobsConfig) -> Self {
        let clock = ManualClock::new(start_time());
        let stores = QueueStores::memory(&config);
        let ctx = QueueContext::new(config, stores, Arc::new(clock.clone()));
        Self { ctx, clock }
    }

    pub async fn driver(&self) -> Arc<dyn QueueDriver> {
        self.ctx.connection(None).await.unwrap()
    }
}
