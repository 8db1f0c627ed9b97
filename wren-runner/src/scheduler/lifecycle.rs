//! Job lifecycle
//!
//! Drives a single job from claim to a terminal outcome:
//!
//! ```text
//! Claiming -> Leased -> Executing -> Finalizing -> Done
//!     \          \           \            \
//!      +----------+-----------+------------+--> Aborted
//! ```
//!
//! The lease is kept alive by a [`HeartbeatTask`] for as long as the job is
//! held. If the lease is lost, the job is abandoned locally and nothing is
//! submitted. Otherwise exactly one submission (result or failure report) is
//! made, retried with backoff until acknowledged or out of attempts.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wren_client::{Ack, ClaimOutcome};
use wren_core::domain::failure::{FailureKind, FailureReport, RetryHint};
use wren_core::domain::job::Job;
use wren_core::dto::job::SubmitResultRequest;

use super::backoff::backoff_delay;
use super::heartbeat::{HeartbeatReport, HeartbeatTask, LeaseLoss};
use crate::config::TimingConfig;
use crate::context::JobWorkspace;
use crate::repository::JobRepository;
use crate::service::{
    ProgressReporter, TranscriptionContext, TranscriptionFailure, TranscriptionRequest,
    TranscriptionService,
};

/// Errors that stop the runner, not just the job
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("backend rejected the runner's credentials: {0}")]
    Unauthorized(String),
}

/// Where a job currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Claiming,
    Leased,
    Executing,
    Finalizing,
    Done,
    Aborted,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Claiming => "claiming",
            JobState::Leased => "leased",
            JobState::Executing => "executing",
            JobState::Finalizing => "finalizing",
            JobState::Done => "done",
            JobState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Which kind of submission a job ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    Result,
    Failure(FailureKind),
}

/// Why a job was dropped without a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Another runner won the claim
    AlreadyClaimed,
    /// The claim failed with a transient error
    ClaimUnavailable(String),
    /// The backend answered with something the runner does not understand
    ProtocolViolation(String),
    LeaseLost(LeaseLoss),
}

/// Terminal outcome of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The backend acknowledged the submission
    Submitted {
        kind: SubmissionKind,
        ack: Ack,
        attempts: u32,
    },
    /// Every submission attempt failed; the lease will lapse on its own
    SubmissionDropped {
        kind: SubmissionKind,
        attempts: u32,
        last_error: String,
    },
    Aborted(AbortReason),
}

impl JobOutcome {
    /// Whether the worker loop should back off before polling again
    ///
    /// Lost races and finished jobs re-poll at once. Backend trouble and
    /// answers the runner cannot use are paced like failed polls.
    pub fn calls_for_backoff(&self) -> bool {
        match self {
            JobOutcome::Aborted(reason) => match reason {
                AbortReason::AlreadyClaimed => false,
                AbortReason::ClaimUnavailable(_) | AbortReason::ProtocolViolation(_) => true,
                AbortReason::LeaseLost(loss) => matches!(
                    loss,
                    LeaseLoss::RenewalFailed { .. }
                        | LeaseLoss::Rejected(_)
                        | LeaseLoss::TaskFailed(_)
                ),
            },
            JobOutcome::SubmissionDropped { .. } => true,
            JobOutcome::Submitted { .. } => false,
        }
    }
}

/// What execution leaves to submit
enum Submission {
    Result(SubmitResultRequest),
    Failure(FailureReport),
}

impl Submission {
    fn kind(&self) -> SubmissionKind {
        match self {
            Submission::Result(_) => SubmissionKind::Result,
            Submission::Failure(report) => SubmissionKind::Failure(report.kind),
        }
    }
}

enum AudioFetch {
    Fetched(Vec<u8>),
    Failed(FailureReport),
    Cancelled,
}

enum Finalized {
    Acknowledged {
        kind: SubmissionKind,
        ack: Ack,
        attempts: u32,
    },
    Exhausted {
        kind: SubmissionKind,
        attempts: u32,
        last_error: String,
    },
    LeaseLost,
    Rejected(String),
}

/// State machine for one job
pub struct JobLifecycle<'a> {
    job: Job,
    repository: Arc<dyn JobRepository>,
    transcriber: &'a Arc<dyn TranscriptionService>,
    timing: &'a TimingConfig,
    work_dir: &'a Path,
    state: JobState,
}

impl<'a> JobLifecycle<'a> {
    /// Creates the lifecycle for a job returned by a poll
    ///
    /// # Arguments
    /// * `job` - The polled job, not yet claimed
    /// * `repository` - Backend access
    /// * `transcriber` - Engine lent for the duration of this job
    /// * `timing` - Heartbeat and retry settings
    /// * `work_dir` - Base directory for the job's workspace
    pub fn new(
        job: Job,
        repository: Arc<dyn JobRepository>,
        transcriber: &'a Arc<dyn TranscriptionService>,
        timing: &'a TimingConfig,
        work_dir: &'a Path,
    ) -> Self {
        Self {
            job,
            repository,
            transcriber,
            timing,
            work_dir,
            state: JobState::Claiming,
        }
    }

    /// Runs the job to a terminal outcome
    ///
    /// Returns `Err` only for failures that must stop the whole runner.
    pub async fn run(mut self) -> Result<JobOutcome, FatalError> {
        info!("Claiming job {} (audio {})", self.job.id, self.job.audio);

        let lease = match self.repository.claim(&self.job.id).await {
            Ok(ClaimOutcome::Leased(lease)) => lease,
            Ok(ClaimOutcome::AlreadyClaimed) => {
                info!("Job {} was claimed by another runner", self.job.id);
                return Ok(self.abort(AbortReason::AlreadyClaimed));
            }
            Err(e) if e.is_auth_failure() => {
                self.transition(JobState::Aborted);
                return Err(FatalError::Unauthorized(e.to_string()));
            }
            Err(e) if e.is_retryable() => {
                warn!("Failed to claim job {}: {}", self.job.id, e);
                return Ok(self.abort(AbortReason::ClaimUnavailable(e.to_string())));
            }
            Err(e) => {
                error!("Unexpected claim response for job {}: {}", self.job.id, e);
                return Ok(self.abort(AbortReason::ProtocolViolation(e.to_string())));
            }
        };

        self.transition(JobState::Leased);
        info!("Leased job {} until {}", self.job.id, lease.expires_at);

        let lease_lost = CancellationToken::new();
        let (progress, progress_rx) = ProgressReporter::channel();
        let heartbeat = HeartbeatTask::spawn(
            Arc::clone(&self.repository),
            lease,
            self.timing,
            progress_rx,
            lease_lost.clone(),
        );

        let execution = match self.execute(progress, &lease_lost).await {
            Ok(execution) => execution,
            Err(fatal) => {
                heartbeat.stop().await;
                self.transition(JobState::Aborted);
                return Err(fatal);
            }
        };

        // A result produced after the lease was lost belongs to nobody
        let submission = match execution {
            Some(submission) if !lease_lost.is_cancelled() => submission,
            _ => {
                let report = heartbeat.stop().await;
                return self.abandon(report);
            }
        };

        self.transition(JobState::Finalizing);
        let finalized = self.finalize(submission, &lease_lost).await;
        let report = heartbeat.stop().await;
        if let Some(lease) = &report.lease {
            debug!(
                "Heartbeat for job {} stopped after {} renewals, lease valid until {}",
                self.job.id, report.renewals, lease.expires_at
            );
        }

        let outcome = match finalized? {
            Finalized::Acknowledged {
                kind,
                ack,
                attempts,
            } => {
                self.transition(JobState::Done);
                info!(
                    "Job {} finished, {:?} acknowledged ({:?}) after {} attempt(s)",
                    self.job.id, kind, ack, attempts
                );
                JobOutcome::Submitted {
                    kind,
                    ack,
                    attempts,
                }
            }
            Finalized::Exhausted {
                kind,
                attempts,
                last_error,
            } => {
                self.transition(JobState::Done);
                error!(
                    "Giving up on submitting {:?} for job {} after {} attempts: {}",
                    kind, self.job.id, attempts, last_error
                );
                JobOutcome::SubmissionDropped {
                    kind,
                    attempts,
                    last_error,
                }
            }
            Finalized::LeaseLost => return self.abandon(report),
            Finalized::Rejected(message) => {
                error!("Submission for job {} rejected: {}", self.job.id, message);
                self.abort(AbortReason::ProtocolViolation(message))
            }
        };

        Ok(outcome)
    }

    fn transition(&mut self, next: JobState) {
        info!("Job {}: {} -> {}", self.job.id, self.state, next);
        self.state = next;
    }

    fn abort(&mut self, reason: AbortReason) -> JobOutcome {
        self.transition(JobState::Aborted);
        JobOutcome::Aborted(reason)
    }

    /// Ends the job after its lease was lost
    fn abandon(&mut self, report: HeartbeatReport) -> Result<JobOutcome, FatalError> {
        let loss = report.loss.unwrap_or(LeaseLoss::Expired);
        if let LeaseLoss::Unauthorized(message) = loss {
            self.transition(JobState::Aborted);
            return Err(FatalError::Unauthorized(message));
        }

        warn!("Abandoning job {}: {}", self.job.id, loss);
        Ok(self.abort(AbortReason::LeaseLost(loss)))
    }

    fn failure(&self, kind: FailureKind, detail: impl Into<String>) -> Submission {
        Submission::Failure(FailureReport::new(self.job.id.clone(), kind, detail))
    }

    /// Produces the submission for the job, or `None` if it was cancelled
    async fn execute(
        &mut self,
        progress: ProgressReporter,
        lease_lost: &CancellationToken,
    ) -> Result<Option<Submission>, FatalError> {
        if let Err(e) = self.job.options.validate() {
            warn!("Job {} has unsupported options: {}", self.job.id, e);
            return Ok(Some(self.failure(FailureKind::UnsupportedOptions, e.to_string())));
        }

        self.transition(JobState::Executing);

        let workspace = match JobWorkspace::create(self.work_dir, &self.job.id) {
            Ok(workspace) => workspace,
            Err(e) => {
                error!("Failed to create workspace for job {}: {}", self.job.id, e);
                return Ok(Some(self.failure(
                    FailureKind::EngineError,
                    format!("failed to create working directory: {e}"),
                )));
            }
        };

        debug!("Workspace for job {}: {}", self.job.id, workspace.path().display());
        let result = self.execute_in(&workspace, progress, lease_lost).await;
        workspace.cleanup();
        result
    }

    async fn execute_in(
        &self,
        workspace: &JobWorkspace,
        progress: ProgressReporter,
        lease_lost: &CancellationToken,
    ) -> Result<Option<Submission>, FatalError> {
        let audio = match self.fetch_audio(lease_lost).await? {
            AudioFetch::Fetched(audio) => audio,
            AudioFetch::Failed(report) => return Ok(Some(Submission::Failure(report))),
            AudioFetch::Cancelled => return Ok(None),
        };

        if audio.is_empty() {
            return Ok(Some(
                self.failure(FailureKind::CorruptedInput, "audio file is empty"),
            ));
        }

        let audio_path = match workspace.write_audio(&audio) {
            Ok(path) => path,
            Err(e) => {
                error!("Failed to store audio for job {}: {}", self.job.id, e);
                return Ok(Some(self.failure(
                    FailureKind::EngineError,
                    format!("failed to store audio: {e}"),
                )));
            }
        };
        drop(audio);

        let request = TranscriptionRequest {
            job_id: self.job.id.clone(),
            audio_path,
            options: self.job.options.clone(),
        };
        let ctx = TranscriptionContext {
            progress,
            cancel: lease_lost.clone(),
        };

        info!(
            "Transcribing job {} with {} (model {}, task {})",
            self.job.id,
            self.transcriber.name(),
            self.job.options.model,
            self.job.options.task
        );

        let started = Instant::now();
        let transcriber = Arc::clone(self.transcriber);
        let mut handle = tokio::task::spawn_blocking(move || transcriber.transcribe(&request, &ctx));

        let mut notified = false;
        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                _ = lease_lost.cancelled(), if !notified => {
                    notified = true;
                    if self.transcriber.supports_cancellation() {
                        info!("Cancelling transcription of job {}", self.job.id);
                    } else {
                        warn!(
                            "Lease on job {} lost, its transcription will run to completion and be discarded",
                            self.job.id
                        );
                    }
                }
            }
        };

        let submission = match joined {
            Ok(Ok(transcript)) => {
                info!(
                    "Transcribed job {} in {:.1?} ({} segments, language {})",
                    self.job.id,
                    started.elapsed(),
                    transcript.segments.len(),
                    transcript.language
                );
                Submission::Result(SubmitResultRequest::render(
                    transcript,
                    &self.job.options.subtitle_layout(),
                ))
            }
            Ok(Err(TranscriptionFailure::Cancelled)) if lease_lost.is_cancelled() => {
                return Ok(None);
            }
            Ok(Err(failure)) => {
                warn!("Transcription of job {} failed: {}", self.job.id, failure);
                let kind = failure.kind().unwrap_or(FailureKind::EngineError);
                self.failure(kind, failure.to_string())
            }
            Err(e) => {
                error!("Transcription of job {} crashed: {}", self.job.id, e);
                self.failure(FailureKind::EngineError, format!("engine crashed: {e}"))
            }
        };

        Ok(Some(submission))
    }

    /// Downloads the job's audio, retrying transient failures
    async fn fetch_audio(&self, lease_lost: &CancellationToken) -> Result<AudioFetch, FatalError> {
        let max_attempts = self.timing.submit_max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let e = match self.repository.fetch_audio(&self.job).await {
                Ok(audio) => return Ok(AudioFetch::Fetched(audio)),
                Err(e) => e,
            };

            // A rejected token is only fatal when the backend itself saw it
            if e.is_auth_failure() && self.repository.sends_credentials(&self.job.audio) {
                return Err(FatalError::Unauthorized(e.to_string()));
            }

            if !e.is_retryable() {
                warn!("Audio for job {} unavailable: {}", self.job.id, e);
                let report = FailureReport::new(
                    self.job.id.clone(),
                    FailureKind::InputUnavailable,
                    format!("cannot fetch {}: {}", self.job.audio, e),
                )
                .with_retry_hint(RetryHint::Abandon);
                return Ok(AudioFetch::Failed(report));
            }

            if attempt >= max_attempts {
                warn!(
                    "Audio for job {} still unavailable after {} attempts: {}",
                    self.job.id, attempt, e
                );
                let report = FailureReport::new(
                    self.job.id.clone(),
                    FailureKind::InputUnavailable,
                    format!("cannot fetch {} after {} attempts: {}", self.job.audio, attempt, e),
                )
                .with_retry_hint(RetryHint::Retry);
                return Ok(AudioFetch::Failed(report));
            }

            let delay = backoff_delay(
                attempt - 1,
                self.timing.submit_backoff_base,
                self.timing.submit_backoff_max,
            );
            warn!(
                "Fetching audio for job {} failed (attempt {}/{}), retrying in {:?}: {}",
                self.job.id, attempt, max_attempts, delay, e
            );
            tokio::select! {
                _ = lease_lost.cancelled() => return Ok(AudioFetch::Cancelled),
                _ = time::sleep(delay) => {}
            }
        }
    }

    /// Delivers the submission, retrying the identical request
    async fn finalize(
        &self,
        submission: Submission,
        lease_lost: &CancellationToken,
    ) -> Result<Finalized, FatalError> {
        let kind = submission.kind();
        let max_attempts = self.timing.submit_max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if lease_lost.is_cancelled() {
                return Ok(Finalized::LeaseLost);
            }

            attempt += 1;
            let result = match &submission {
                Submission::Result(result) => {
                    self.repository.submit_result(&self.job.id, result).await
                }
                Submission::Failure(report) => self.repository.submit_failure(report).await,
            };

            let e = match result {
                Ok(ack) => {
                    return Ok(Finalized::Acknowledged {
                        kind,
                        ack,
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            if e.is_auth_failure() {
                return Err(FatalError::Unauthorized(e.to_string()));
            }
            if !e.is_retryable() {
                return Ok(Finalized::Rejected(e.to_string()));
            }
            if attempt >= max_attempts {
                return Ok(Finalized::Exhausted {
                    kind,
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }

            let delay = backoff_delay(
                attempt - 1,
                self.timing.submit_backoff_base,
                self.timing.submit_backoff_max,
            );
            warn!(
                "Submitting {:?} for job {} failed (attempt {}/{}), retrying in {:?}: {}",
                kind, self.job.id, attempt, max_attempts, delay, e
            );
            tokio::select! {
                _ = lease_lost.cancelled() => return Ok(Finalized::LeaseLost),
                _ = time::sleep(delay) => {}
            }
        }
    }
}
