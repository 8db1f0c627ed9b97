//! Jobs repository
//!
//! Handles communication with the backend for job-related operations:
//! - Polling for work
//! - Claiming jobs and renewing their leases
//! - Fetching input audio
//! - Submitting results and failure reports

use async_trait::async_trait;
use wren_client::{Ack, BackendClient, ClaimOutcome, HeartbeatOutcome, PollOutcome, Result};
use wren_core::domain::failure::FailureReport;
use wren_core::domain::job::{AudioRef, Job, JobId};
use wren_core::domain::lease::Lease;
use wren_core::dto::job::SubmitResultRequest;

/// Repository trait for job-related operations with the backend
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Asks the backend whether a job is waiting for this runner
    async fn poll_for_job(&self) -> Result<PollOutcome>;

    /// Attempts to take ownership of a job
    async fn claim(&self, job_id: &JobId) -> Result<ClaimOutcome>;

    /// Renews the lease on a job, reporting progress in percent
    async fn heartbeat(&self, lease: &Lease, progress: f32) -> Result<HeartbeatOutcome>;

    /// Downloads the input audio of a job
    async fn fetch_audio(&self, job: &Job) -> Result<Vec<u8>>;

    /// Whether fetching `audio` presents the runner's credentials
    fn sends_credentials(&self, audio: &AudioRef) -> bool;

    /// Submits the transcript of a finished job
    async fn submit_result(&self, job_id: &JobId, result: &SubmitResultRequest) -> Result<Ack>;

    /// Submits a failure report
    async fn submit_failure(&self, report: &FailureReport) -> Result<Ack>;
}

#[async_trait]
impl JobRepository for BackendClient {
    async fn poll_for_job(&self) -> Result<PollOutcome> {
        BackendClient::poll_for_job(self).await
    }

    async fn claim(&self, job_id: &JobId) -> Result<ClaimOutcome> {
        BackendClient::claim(self, job_id).await
    }

    async fn heartbeat(&self, lease: &Lease, progress: f32) -> Result<HeartbeatOutcome> {
        BackendClient::heartbeat(self, lease, progress).await
    }

    async fn fetch_audio(&self, job: &Job) -> Result<Vec<u8>> {
        BackendClient::fetch_audio(self, job).await
    }

    fn sends_credentials(&self, audio: &AudioRef) -> bool {
        BackendClient::sends_credentials(self, audio)
    }

    async fn submit_result(&self, job_id: &JobId, result: &SubmitResultRequest) -> Result<Ack> {
        BackendClient::submit_result(self, job_id, result).await
    }

    async fn submit_failure(&self, report: &FailureReport) -> Result<Ack> {
        BackendClient::submit_failure(self, report).await
    }
}
