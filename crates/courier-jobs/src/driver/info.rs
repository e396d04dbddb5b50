//! Driver metadata and health snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Immutable description of a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    /// Supported feature names (e.g. `delayed`, `bulk`, `priority`).
    pub features: Vec<String>,
    /// Package or extension name to version requirement ("*" for a bare name).
    pub dependencies: BTreeMap<String, String>,
    pub documentation_url: Option<String>,
}

impl DriverInfo {
    /// Creates driver info with a name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            author: String::new(),
            description: String::new(),
            features: Vec::new(),
            dependencies: BTreeMap::new(),
            documentation_url: None,
        }
    }

    #[must_use]
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn dependency(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), version.into());
        self
    }

    #[must_use]
    pub fn documentation_url(mut self, url: impl Into<String>) -> Self {
        self.documentation_url = Some(url.into());
        self
    }

    /// Returns true if the driver advertises a feature.
    pub fn supports(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Health state enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Point-in-time health of a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub metrics: BTreeMap<String, Value>,
    pub message: String,
    pub response_time_ms: Option<f64>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    fn build(status: HealthState, message: impl Into<String>) -> Self {
        Self {
            status,
            metrics: BTreeMap::new(),
            message: message.into(),
            response_time_ms: None,
            checked_at: Utc::now(),
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::build(HealthState::Healthy, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::build(HealthState::Degraded, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::build(HealthState::Unhealthy, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::build(HealthState::Unknown, message)
    }

    #[must_use]
    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_response_time(mut self, elapsed: Duration) -> Self {
        self.response_time_ms = Some(elapsed.as_secs_f64() * 1000.0);
        self
    }

    /// True for healthy and degraded drivers.
    pub fn is_operational(&self) -> bool {
        matches!(self.status, HealthState::Healthy | HealthState::Degraded)
    }
}
