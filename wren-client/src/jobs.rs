//! Job-related API endpoints

use reqwest::StatusCode;
use tracing::debug;
use wren_core::domain::failure::FailureReport;
use wren_core::domain::job::{AudioRef, Job, JobId};
use wren_core::domain::lease::Lease;
use wren_core::dto::job::{HeartbeatRequest, HeartbeatResponse, PollResponse, SubmitResultRequest};

use crate::BackendClient;
use crate::error::Result;

/// Outcome of asking the backend for work
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Job(Job),
    /// The queue holds nothing for this runner right now
    NoJobAvailable,
}

/// Outcome of trying to take ownership of a job
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Leased(Lease),
    /// Another runner won the race
    AlreadyClaimed,
}

/// Outcome of a lease renewal
#[derive(Debug, Clone)]
pub enum HeartbeatOutcome {
    Renewed(Lease),
    /// The lease lapsed; another runner may own the job now
    LeaseExpired,
    /// The backend revoked the job
    Aborted,
}

/// Acknowledgement of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Accepted,
    /// The backend already holds this outcome from an earlier attempt
    AlreadyRecorded,
}

impl BackendClient {
    // =============================================================================
    // Job Acquisition
    // =============================================================================

    /// Ask the backend whether a job is waiting for this runner
    pub async fn poll_for_job(&self) -> Result<PollOutcome> {
        let response = self.post("/api/runners/jobs/poll").send().await?;

        if Self::is(&response, StatusCode::NO_CONTENT) {
            return Ok(PollOutcome::NoJobAvailable);
        }

        let body: PollResponse = self.handle_response(response).await?;
        Ok(match body.job {
            Some(job) => PollOutcome::Job(job),
            None => PollOutcome::NoJobAvailable,
        })
    }

    /// Claim a job for execution by this runner
    ///
    /// # Returns
    /// The lease on success, or [`ClaimOutcome::AlreadyClaimed`] if another
    /// runner owns the job
    pub async fn claim(&self, job_id: &JobId) -> Result<ClaimOutcome> {
        let path = format!("/api/runners/jobs/{}/claim", job_id);
        let response = self.post(&path).send().await?;

        if Self::is(&response, StatusCode::CONFLICT) {
            debug!("Job {} already claimed by another runner", job_id);
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let lease: Lease = self.handle_response(response).await?;
        Ok(ClaimOutcome::Leased(lease))
    }

    /// Renew the lease on a job
    ///
    /// # Arguments
    /// * `lease` - The current lease
    /// * `progress` - Progress of the job in percent, reported alongside
    pub async fn heartbeat(&self, lease: &Lease, progress: f32) -> Result<HeartbeatOutcome> {
        let path = format!("/api/runners/jobs/{}/heartbeat", lease.job_id);
        let response = self
            .post(&path)
            .json(&HeartbeatRequest {
                renewal_token: lease.renewal_token.clone(),
                progress,
            })
            .send()
            .await?;

        if Self::is(&response, StatusCode::GONE) || Self::is(&response, StatusCode::NOT_FOUND) {
            return Ok(HeartbeatOutcome::LeaseExpired);
        }

        let body: HeartbeatResponse = self.handle_response(response).await?;
        if body.abort {
            return Ok(HeartbeatOutcome::Aborted);
        }

        Ok(HeartbeatOutcome::Renewed(body.lease))
    }

    /// Download the input audio of a job
    ///
    /// Relative references are resolved against the base URL. The bearer
    /// token is only attached when the audio is served by the backend itself.
    pub async fn fetch_audio(&self, job: &Job) -> Result<Vec<u8>> {
        let url = self.audio_url(&job.audio);

        let mut request = self.client.get(&url);
        if self.is_backend_origin(&url) {
            request = request.bearer_auth(&self.token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let bytes = response.bytes().await?;
        debug!("Fetched {} bytes of audio for job {}", bytes.len(), job.id);
        Ok(bytes.to_vec())
    }

    // =============================================================================
    // Job Completion
    // =============================================================================

    /// Submit the transcript of a finished job
    ///
    /// Safe to repeat with the same body after a transient failure.
    pub async fn submit_result(&self, job_id: &JobId, result: &SubmitResultRequest) -> Result<Ack> {
        let path = format!("/api/runners/jobs/{}/result", job_id);
        let response = self.post(&path).json(result).send().await?;
        self.submission_ack(response).await
    }

    /// Submit a failure report for a job
    ///
    /// Same idempotency contract as [`BackendClient::submit_result`].
    pub async fn submit_failure(&self, report: &FailureReport) -> Result<Ack> {
        let path = format!("/api/runners/jobs/{}/failure", report.job_id);
        let response = self.post(&path).json(report).send().await?;
        self.submission_ack(response).await
    }

    /// Whether fetching `audio` sends the runner token along
    ///
    /// True for backend-relative references and for absolute URLs on the
    /// backend's own origin (same scheme, host and port).
    pub fn sends_credentials(&self, audio: &AudioRef) -> bool {
        self.is_backend_origin(&self.audio_url(audio))
    }

    fn audio_url(&self, audio: &AudioRef) -> String {
        if audio.is_absolute() {
            audio.as_str().to_string()
        } else {
            self.url(audio.as_str())
        }
    }

    async fn submission_ack(&self, response: reqwest::Response) -> Result<Ack> {
        if Self::is(&response, StatusCode::CONFLICT) {
            return Ok(Ack::AlreadyRecorded);
        }

        self.handle_empty_response(response).await?;
        Ok(Ack::Accepted)
    }
}
