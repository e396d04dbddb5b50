//! Job-logic failures and retryability classification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure classes that indicate a programming or deployment defect.
const PERMANENT_CLASSES: &[&str] = &["ParseError", "TypeError", "ArgumentCountError", "Error"];

/// Message fragments that indicate a programming or deployment defect.
const PERMANENT_MESSAGE_FRAGMENTS: &[&str] = &[
    "class not found",
    "undefined method",
    "undefined property",
    "syntax error",
    "parse error",
    "fatal error",
];

/// How a failure was classified by the code that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retrying cannot help.
    Permanent,
    /// May succeed on another attempt.
    Transient,
    /// No explicit classification; the class/message heuristic decides.
    Unclassified,
}

/// A failure raised while a job was running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Classification.
    pub kind: FailureKind,

    /// Failure class name (e.g. `RuntimeException`).
    pub class: String,

    /// Human-readable message.
    pub message: String,

    /// Optional stack trace or context.
    pub trace: Option<String>,
}

impl JobFailure {
    /// Creates a failure with an explicit kind.
    pub fn new(kind: FailureKind, class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            class: class.into(),
            message: message.into(),
            trace: None,
        }
    }

    /// A failure that must never be retried.
    pub fn permanent(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, class, message)
    }

    /// A failure that may succeed on retry.
    pub fn transient(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, class, message)
    }

    /// A failure from a call site that did not classify it.
    pub fn unclassified(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unclassified, class, message)
    }

    /// A job that exceeded its execution timeout.
    pub fn timeout(seconds: u64) -> Self {
        Self::transient(
            "TimeoutException",
            format!("Job exceeded timeout of {seconds} seconds"),
        )
    }

    /// Attaches a stack trace.
    #[must_use]
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Returns true if retrying the job may help.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            FailureKind::Permanent => false,
            FailureKind::Transient => true,
            FailureKind::Unclassified => is_retryable_failure(&self.class, &self.message),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for JobFailure {}

/// Best-effort classifier for failures without an explicit kind.
///
/// Unknown classes are retryable unless the message carries one of the
/// defect fragments (case-insensitive).
pub fn is_retryable_failure(class: &str, message: &str) -> bool {
    if PERMANENT_CLASSES.contains(&class) {
        return false;
    }

    let message = message.to_lowercase();
    !PERMANENT_MESSAGE_FRAGMENTS
        .iter()
        .any(|fragment| message.contains(fragment))
}
