//! Wire payload envelope and decoding.
//!
//! Payloads are stored as a JSON envelope. Decoding tries plain JSON first,
//! then a `base64:`-prefixed envelope. The decoded job class must pass the
//! allow-list before a job can be rebuilt from it.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Prefix marking a base64-encoded envelope.
pub const BASE64_PREFIX: &str = "base64:";

/// Serialized form of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub uuid: JobId,
    pub job_class: String,
    pub queue: String,
    pub data: Value,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub batch_uuid: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Job> for JobPayload {
    fn from(job: &Job) -> Self {
        Self {
            uuid: job.id.clone(),
            job_class: job.job_class.clone(),
            queue: job.queue.clone(),
            data: job.data.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            timeout_seconds: job.timeout_seconds,
            priority: job.priority,
            batch_uuid: job.batch_uuid.clone(),
            created_at: job.created_at,
        }
    }
}

impl JobPayload {
    /// Encodes the envelope as JSON.
    pub fn to_json(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decodes stored payloads, restricted to an allow-list of job classes.
#[derive(Debug, Clone, Default)]
pub struct PayloadCodec {
    allow_list: HashSet<String>,
}

impl PayloadCodec {
    /// Creates a codec. An empty allow-list accepts any class.
    pub fn new<I, S>(allow_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow_list: allow_list.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if the class may be rebuilt.
    pub fn is_allowed(&self, job_class: &str) -> bool {
        self.allow_list.is_empty() || self.allow_list.contains(job_class)
    }

    /// Encodes a job into its stored form.
    pub fn encode(&self, job: &Job) -> JobResult<String> {
        JobPayload::from(job).to_json()
    }

    /// Decodes a stored payload.
    pub fn decode(&self, raw: &str) -> JobResult<JobPayload> {
        let payload = match serde_json::from_str::<JobPayload>(raw) {
            Ok(payload) => payload,
            Err(json_err) => Self::decode_base64(raw).ok_or_else(|| {
                JobError::InvalidPayload(format!("Unreadable payload: {json_err}"))
            })?,
        };

        if payload.job_class.is_empty() {
            return Err(JobError::InvalidPayload("Payload has no job class".into()));
        }
        if !self.is_allowed(&payload.job_class) {
            return Err(JobError::InvalidPayload(format!(
                "Job class '{}' is not in the payload allow-list",
                payload.job_class
            )));
        }

        Ok(payload)
    }

    fn decode_base64(raw: &str) -> Option<JobPayload> {
        let encoded = raw.trim().strip_prefix(BASE64_PREFIX)?;
        let bytes = STANDARD.decode(encoded).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(class: &str) -> JobPayload {
        JobPayload {
            uuid: JobId::from("job-1"),
            job_class: class.to_string(),
            queue: "default".to_string(),
            data: json!({"to": "user@example.com"}),
            attempts: 3,
            max_attempts: 3,
            timeout_seconds: 60,
            priority: 0,
            batch_uuid: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_decode_plain_json() {
        let raw = payload("SendEmail").to_json().unwrap();
        let decoded = PayloadCodec::default().decode(&raw).unwrap();
        assert_eq!(decoded.job_class, "SendEmail");
        assert_eq!(decoded.data["to"], "user@example.com");
    }

    #[test]
    fn test_decode_base64_envelope() {
        let json = payload("SendEmail").to_json().unwrap();
        let raw = format!("{BASE64_PREFIX}{}", STANDARD.encode(json));
        let decoded = PayloadCodec::default().decode(&raw).unwrap();
        assert_eq!(decoded.uuid.as_str(), "job-1");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = PayloadCodec::default().decode("O:8:\"stdClass\":0:{}").unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));

        let err = PayloadCodec::default().decode("base64:!!!").unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));
    }

    #[test]
    fn test_allow_list() {
        let codec = PayloadCodec::new(["SendEmail"]);
        let allowed = payload("SendEmail").to_json().unwrap();
        let denied = payload("DropTables").to_json().unwrap();

        assert!(codec.decode(&allowed).is_ok());
        assert!(matches!(
            codec.decode(&denied),
            Err(JobError::InvalidPayload(msg)) if msg.contains("DropTables")
        ));
    }
}
