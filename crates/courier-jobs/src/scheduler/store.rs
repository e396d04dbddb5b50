//! Persistence of scheduled jobs and their execution history.

use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shaku::{Component, Interface};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A recurring task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub uuid: String,
    pub name: String,
    /// Cron expression as registered.
    pub schedule: String,
    /// Name of the task in the task registry.
    pub handler_class: String,
    pub parameters: Value,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    /// False for in-process registrations that are lost on restart.
    pub persistent: bool,
}

/// Outcome of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    /// Another process held the task's lease.
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(JobError::Internal(format!("Unknown execution status: {other}"))),
        }
    }
}

/// One recorded run of a persistent scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub uuid: String,
    pub job_uuid: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Task output on success, error text on failure.
    pub result: Option<String>,
}

/// Storage for persistent scheduled jobs.
#[async_trait]
pub trait ScheduleStore: Interface + Send + Sync {
    async fn insert_job(&self, job: &ScheduledJob) -> JobResult<()>;

    /// Every stored job, ordered by name.
    async fn jobs(&self) -> JobResult<Vec<ScheduledJob>>;

    async fn find_job(&self, uuid: &str) -> JobResult<Option<ScheduledJob>>;

    async fn find_job_by_name(&self, name: &str) -> JobResult<Option<ScheduledJob>>;

    /// Returns true if a job with that name exists.
    async fn set_enabled(&self, name: &str, enabled: bool) -> JobResult<bool>;

    /// Deletes a job and its history. Returns true if it existed.
    async fn delete_job(&self, name: &str) -> JobResult<bool>;

    /// Stores the run time and the next fire time.
    async fn record_run(
        &self,
        uuid: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> JobResult<()>;

    async fn insert_execution(&self, execution: &JobExecution) -> JobResult<()>;

    async fn finish_execution(
        &self,
        uuid: &str,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        result: Option<String>,
    ) -> JobResult<()>;

    /// Most recent executions of a job, newest first.
    async fn executions(&self, job_uuid: &str, limit: u64) -> JobResult<Vec<JobExecution>>;
}

#[derive(Debug, Default)]
struct MemoryScheduleState {
    jobs: HashMap<String, ScheduledJob>,
    executions: Vec<JobExecution>,
}

/// Schedule store held in process memory.
#[derive(Debug, Default, Component)]
#[shaku(interface = ScheduleStore)]
pub struct MemoryScheduleStore {
    #[shaku(default)]
    state: RwLock<MemoryScheduleState>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert_job(&self, job: &ScheduledJob) -> JobResult<()> {
        self.state.write().jobs.insert(job.uuid.clone(), job.clone());
        Ok(())
    }

    async fn jobs(&self) -> JobResult<Vec<ScheduledJob>> {
        let mut jobs: Vec<ScheduledJob> = self.state.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.uuid.cmp(&b.uuid)));
        Ok(jobs)
    }

    async fn find_job(&self, uuid: &str) -> JobResult<Option<ScheduledJob>> {
        Ok(self.state.read().jobs.get(uuid).cloned())
    }

    async fn find_job_by_name(&self, name: &str) -> JobResult<Option<ScheduledJob>> {
        Ok(self.state.read().jobs.values().find(|j| j.name == name).cloned())
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> JobResult<bool> {
        let mut state = self.state.write();
        let mut found = false;
        for job in state.jobs.values_mut().filter(|j| j.name == name) {
            job.enabled = enabled;
            found = true;
        }
        Ok(found)
    }

    async fn delete_job(&self, name: &str) -> JobResult<bool> {
        let mut state = self.state.write();
        let uuids: Vec<String> = state
            .jobs
            .values()
            .filter(|j| j.name == name)
            .map(|j| j.uuid.clone())
            .collect();
        for uuid in &uuids {
            state.jobs.remove(uuid);
        }
        state.executions.retain(|e| !uuids.contains(&e.job_uuid));
        Ok(!uuids.is_empty())
    }

    async fn record_run(
        &self,
        uuid: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> JobResult<()> {
        if let Some(job) = self.state.write().jobs.get_mut(uuid) {
            job.last_run = Some(last_run);
            job.next_run = next_run;
        }
        Ok(())
    }

    async fn insert_execution(&self, execution: &JobExecution) -> JobResult<()> {
        self.state.write().executions.push(execution.clone());
        Ok(())
    }

    async fn finish_execution(
        &self,
        uuid: &str,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        result: Option<String>,
    ) -> JobResult<()> {
        let mut state = self.state.write();
        if let Some(execution) = state.executions.iter_mut().find(|e| e.uuid == uuid) {
            execution.status = status;
            execution.completed_at = Some(completed_at);
            execution.result = result;
        }
        Ok(())
    }

    async fn executions(&self, job_uuid: &str, limit: u64) -> JobResult<Vec<JobExecution>> {
        let state = self.state.read();
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let mut executions: Vec<JobExecution> = state
            .executions
            .iter()
            .filter(|e| e.job_uuid == job_uuid)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        executions.truncate(limit);
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(uuid: &str, name: &str) -> ScheduledJob {
        ScheduledJob {
            uuid: uuid.to_string(),
            name: name.to_string(),
            schedule: "@hourly".to_string(),
            handler_class: "Cleanup".to_string(),
            parameters: json!({}),
            enabled: true,
            last_run: None,
            next_run: None,
            persistent: true,
        }
    }

    #[tokio::test]
    async fn test_enable_disable_delete() {
        let store = MemoryScheduleStore::new();
        store.insert_job(&job("1", "cleanup")).await.unwrap();

        assert!(store.set_enabled("cleanup", false).await.unwrap());
        assert!(!store.find_job("1").await.unwrap().unwrap().enabled);
        assert!(!store.set_enabled("missing", false).await.unwrap());

        assert!(store.delete_job("cleanup").await.unwrap());
        assert!(store.jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_executions_newest_first() {
        let store = MemoryScheduleStore::new();
        let base = Utc::now();
        for i in 0..3 {
            store
                .insert_execution(&JobExecution {
                    uuid: format!("e{i}"),
                    job_uuid: "1".to_string(),
                    status: ExecutionStatus::Running,
                    started_at: base + chrono::Duration::minutes(i),
                    completed_at: None,
                    result: None,
                })
                .await
                .unwrap();
        }
        store
            .finish_execution("e2", ExecutionStatus::Completed, base, Some("ok".into()))
            .await
            .unwrap();

        let recent = store.executions("1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].uuid, "e2");
        assert_eq!(recent[0].status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
    }
}
