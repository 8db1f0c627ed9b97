//! Failure reports
//!
//! A failure report is what the runner submits instead of a transcript when a
//! job cannot be completed for reasons tied to the job itself.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::job::JobId;

/// Why a job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The audio container or codec is not supported by the engine
    UnsupportedFormat,
    /// The audio could be read but is damaged or empty
    CorruptedInput,
    /// The audio could not be fetched
    InputUnavailable,
    /// The requested options cannot be honoured
    UnsupportedOptions,
    /// The engine failed internally
    EngineError,
}

impl FailureKind {
    /// Hint sent along when the caller has nothing more specific
    pub fn default_retry_hint(&self) -> RetryHint {
        match self {
            FailureKind::EngineError => RetryHint::Retry,
            _ => RetryHint::Abandon,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::UnsupportedFormat => "unsupported_format",
            FailureKind::CorruptedInput => "corrupted_input",
            FailureKind::InputUnavailable => "input_unavailable",
            FailureKind::UnsupportedOptions => "unsupported_options",
            FailureKind::EngineError => "engine_error",
        };
        f.write_str(name)
    }
}

/// Whether the backend should re-queue the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryHint {
    Retry,
    Abandon,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub job_id: JobId,
    pub kind: FailureKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_hint: Option<RetryHint>,
}

impl FailureReport {
    /// Creates a report carrying the kind's default retry hint
    pub fn new(job_id: JobId, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            job_id,
            kind,
            detail: detail.into(),
            retry_hint: Some(kind.default_retry_hint()),
        }
    }

    pub fn with_retry_hint(mut self, hint: RetryHint) -> Self {
        self.retry_hint = Some(hint);
        self
    }
}
