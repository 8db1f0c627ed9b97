//! Worker loop
//!
//! Polls the backend while idle and hands each job to a [`JobLifecycle`],
//! one job at a time. Poll failures and jobs that end in a backend fault
//! back off exponentially; an empty poll or a finished job resets the pace. Shutdown is only observed between jobs: a leased
//! job always runs to its terminal outcome first.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wren_client::PollOutcome;

use super::backoff::Backoff;
use super::lifecycle::{FatalError, JobLifecycle, JobOutcome, SubmissionKind};
use crate::config::TimingConfig;
use crate::repository::JobRepository;
use crate::service::TranscriptionService;

/// Counters reported when the loop ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub polls: u64,
    /// Jobs whose transcript was acknowledged
    pub completed: u64,
    /// Jobs whose failure report was acknowledged
    pub failed: u64,
    /// Jobs whose submission could not be delivered
    pub dropped: u64,
    /// Jobs given up without a submission
    pub aborted: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Submitted {
                kind: SubmissionKind::Result,
                ..
            } => self.completed += 1,
            JobOutcome::Submitted {
                kind: SubmissionKind::Failure(_),
                ..
            } => self.failed += 1,
            JobOutcome::SubmissionDropped { .. } => self.dropped += 1,
            JobOutcome::Aborted(_) => self.aborted += 1,
        }
    }
}

/// Single-job polling loop
pub struct WorkerLoop {
    repository: Arc<dyn JobRepository>,
    transcriber: Arc<dyn TranscriptionService>,
    timing: TimingConfig,
    work_dir: PathBuf,
    shutdown: CancellationToken,
    stats: WorkerStats,
}

impl WorkerLoop {
    /// Creates a new worker loop
    ///
    /// # Arguments
    /// * `repository` - Backend access
    /// * `transcriber` - The engine, owned by the loop and lent to each job
    /// * `timing` - Poll, heartbeat and retry settings
    /// * `work_dir` - Base directory for per-job workspaces
    /// * `shutdown` - Cancelled to request a graceful stop
    pub fn new(
        repository: Arc<dyn JobRepository>,
        transcriber: Arc<dyn TranscriptionService>,
        timing: TimingConfig,
        work_dir: PathBuf,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repository,
            transcriber,
            timing,
            work_dir,
            shutdown,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Runs until shutdown is requested or a fatal error occurs
    pub async fn run(&mut self) -> Result<(), FatalError> {
        info!(
            "Starting worker loop (engine: {}, poll interval: {:?})",
            self.transcriber.name(),
            self.timing.poll_interval
        );

        let mut backoff = Backoff::new(self.timing.poll_interval, self.timing.max_poll_backoff);

        loop {
            if self.shutdown.is_cancelled() {
                info!("Shutdown requested, worker loop idle");
                return Ok(());
            }

            debug!("Polling for jobs");
            self.stats.polls += 1;

            let delay = match self.repository.poll_for_job().await {
                Ok(PollOutcome::NoJobAvailable) => {
                    debug!("No job available");
                    backoff.succeeded()
                }
                Ok(PollOutcome::Job(job)) => {
                    if self.shutdown.is_cancelled() {
                        info!("Shutdown requested, leaving job {} unclaimed", job.id);
                        return Ok(());
                    }

                    let outcome = JobLifecycle::new(
                        job,
                        Arc::clone(&self.repository),
                        &self.transcriber,
                        &self.timing,
                        &self.work_dir,
                    )
                    .run()
                    .await?;

                    self.stats.record(&outcome);
                    if outcome.calls_for_backoff() {
                        let delay = backoff.failed();
                        debug!(
                            "Job ended in a fault ({} in a row), next poll in {:?}",
                            backoff.failures(),
                            delay
                        );
                        delay
                    } else {
                        backoff.succeeded();
                        Duration::ZERO
                    }
                }
                Err(e) if e.is_auth_failure() => {
                    error!("Polling rejected: {}", e);
                    return Err(FatalError::Unauthorized(e.to_string()));
                }
                Err(e) => {
                    let delay = backoff.failed();
                    if e.is_protocol_violation() {
                        error!("Unexpected poll response: {}", e);
                    }
                    warn!(
                        "Poll failed ({} in a row), retrying in {:?}: {}",
                        backoff.failures(),
                        delay,
                        e
                    );
                    delay
                }
            };

            if delay.is_zero() {
                continue;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, worker loop idle");
                    return Ok(());
                }
                _ = time::sleep(delay) => {}
            }
        }
    }
}
