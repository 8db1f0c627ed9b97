//! Per-job working directory
//!
//! Every job gets a fresh directory below the configured work dir holding
//! the downloaded audio and whatever the engine writes next to it. The
//! directory is removed once the job reaches a terminal state.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;
use wren_core::domain::job::JobId;

/// File name of the downloaded audio inside the workspace
const AUDIO_FILE_NAME: &str = "input.audio";

/// Working directory of one job
#[derive(Debug)]
pub struct JobWorkspace {
    path: PathBuf,
}

impl JobWorkspace {
    /// Creates a new, empty workspace
    ///
    /// # Arguments
    /// * `base` - Base directory for workspaces (e.g., /tmp/wren-runner/jobs)
    /// * `job_id` - The job the workspace belongs to
    pub fn create(base: &Path, job_id: &JobId) -> io::Result<Self> {
        // Job ids are opaque, keep only characters that are safe in a path
        let safe_id: String = job_id
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(64)
            .collect();

        let path = base.join(format!("{}-{}", safe_id, Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path)?;
        debug!("Created workspace {} for job {}", path.display(), job_id);

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores the job's audio and returns its path
    pub fn write_audio(&self, bytes: &[u8]) -> io::Result<PathBuf> {
        let audio_path = self.path.join(AUDIO_FILE_NAME);
        std::fs::write(&audio_path, bytes)?;
        Ok(audio_path)
    }

    /// Removes the workspace, logging instead of failing
    pub fn cleanup(self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed workspace {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove workspace {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}
