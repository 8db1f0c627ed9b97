//! Job domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::options::TranscriptionOptions;

/// Opaque job identifier assigned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Reference to the input audio of a job
///
/// Either an absolute URL or a path relative to the backend base URL.
/// The audio itself is never embedded in the job; it is fetched on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioRef(String);

impl AudioRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when the reference carries its own scheme and host
    pub fn is_absolute(&self) -> bool {
        ["http://", "https://"].iter().any(|scheme| {
            self.0
                .get(..scheme.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(scheme))
        })
    }
}

impl fmt::Display for AudioRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of transcription work assigned to this runner
///
/// Immutable once claimed; only the lease that covers it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub audio: AudioRef,
    #[serde(default)]
    pub options: TranscriptionOptions,
    pub assigned_at: chrono::DateTime<chrono::Utc>,
}
