//! In-process failure store.

use super::{
    hour_bucket, FailedJobFilters, FailedJobRecord, FailedJobStats, FailedJobStore, FailurePatterns,
    HourlyCount, PatternCount,
};
use crate::error::JobResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shaku::Component;
use std::collections::{BTreeMap, HashMap};

/// Failure store backed by a map. Used by tests and single-process setups.
#[derive(Debug, Default, Component)]
#[shaku(interface = FailedJobStore)]
pub struct MemoryFailedJobStore {
    #[shaku(default)]
    records: RwLock<HashMap<String, FailedJobRecord>>,
}

impl MemoryFailedJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn top_counts<'a>(names: impl Iterator<Item = &'a str>, top: usize) -> Vec<PatternCount> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for name in names {
        *counts.entry(name).or_default() += 1;
    }

    let mut counts: Vec<PatternCount> = counts
        .into_iter()
        .map(|(name, count)| PatternCount {
            name: name.to_string(),
            count,
        })
        .collect();
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    counts.truncate(top);
    counts
}

#[async_trait]
impl FailedJobStore for MemoryFailedJobStore {
    async fn insert(&self, record: &FailedJobRecord) -> JobResult<()> {
        self.records.write().insert(record.uuid.clone(), record.clone());
        Ok(())
    }

    async fn find(&self, uuid: &str) -> JobResult<Option<FailedJobRecord>> {
        Ok(self.records.read().get(uuid).cloned())
    }

    async fn list(
        &self,
        filters: &FailedJobFilters,
        limit: Option<u64>,
        offset: u64,
    ) -> JobResult<Vec<FailedJobRecord>> {
        let mut records: Vec<FailedJobRecord> = self
            .records
            .read()
            .values()
            .filter(|r| filters.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then_with(|| a.uuid.cmp(&b.uuid)));

        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let limit = limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self, filters: &FailedJobFilters) -> JobResult<u64> {
        Ok(self.records.read().values().filter(|r| filters.matches(r)).count() as u64)
    }

    async fn delete(&self, uuid: &str) -> JobResult<bool> {
        Ok(self.records.write().remove(uuid).is_some())
    }

    async fn flush(&self) -> JobResult<u64> {
        let mut records = self.records.write();
        let removed = records.len() as u64;
        records.clear();
        Ok(removed)
    }

    async fn mark_retried(&self, uuid: &str, max_retries: u32, at: DateTime<Utc>) -> JobResult<bool> {
        let mut records = self.records.write();
        match records.get_mut(uuid) {
            Some(record) if record.retry_count < max_retries => {
                record.retry_count += 1;
                record.last_retry_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revert_retried(&self, uuid: &str, previous_retry_at: Option<DateTime<Utc>>) -> JobResult<()> {
        if let Some(record) = self.records.write().get_mut(uuid) {
            if record.retry_count > 0 {
                record.retry_count -= 1;
                record.last_retry_at = previous_retry_at;
            }
        }
        Ok(())
    }

    async fn mark_requeued(&self, uuid: &str, at: DateTime<Utc>) -> JobResult<()> {
        if let Some(record) = self.records.write().get_mut(uuid) {
            record.requeued_at = Some(at);
        }
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> JobResult<u64> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| r.failed_at >= cutoff);
        Ok((before - records.len()) as u64)
    }

    async fn stats(&self, filters: &FailedJobFilters, recent_since: DateTime<Utc>) -> JobResult<FailedJobStats> {
        let records = self.records.read();
        let mut stats = FailedJobStats::default();
        for record in records.values().filter(|r| filters.matches(r)) {
            stats.total += 1;
            if record.retryable {
                stats.retryable += 1;
            } else {
                stats.non_retryable += 1;
            }
            if record.failed_at >= recent_since {
                stats.last_24h += 1;
            }
        }
        Ok(stats)
    }

    async fn patterns(&self, top: usize, hourly_since: DateTime<Utc>) -> JobResult<FailurePatterns> {
        let records = self.records.read();

        let mut hourly: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
        for record in records.values().filter(|r| r.failed_at >= hourly_since) {
            *hourly.entry(hour_bucket(record.failed_at)).or_default() += 1;
        }

        Ok(FailurePatterns {
            exception_types: top_counts(records.values().map(|r| r.exception_class.as_str()), top),
            job_classes: top_counts(records.values().map(|r| r.job_class.as_str()), top),
            hourly: hourly
                .into_iter()
                .map(|(hour, count)| HourlyCount { hour, count })
                .collect(),
        })
    }
}
