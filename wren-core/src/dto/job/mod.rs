//! Job DTOs exchanged while processing a job

use serde::{Deserialize, Serialize};

use crate::domain::job::Job;
use crate::domain::lease::Lease;
use crate::domain::options::SubtitleLayout;
use crate::domain::transcript::Transcript;

/// Body of a successful poll
///
/// `job` is `None` when the queue holds nothing for this runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub job: Option<Job>,
}

/// Lease renewal request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub renewal_token: String,
    /// Progress of the current job in percent (0.0 to 100.0)
    pub progress: f32,
}

/// Lease renewal response
///
/// `abort` is set when the backend revoked the job (for example because its
/// owner cancelled it); the runner must stop and submit nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub lease: Lease,
    #[serde(default)]
    pub abort: bool,
}

/// Transcript submission, including pre-rendered subtitle formats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResultRequest {
    pub transcript: Transcript,
    pub as_txt: String,
    pub as_srt: String,
    pub as_vtt: String,
    pub as_tsv: String,
}

impl SubmitResultRequest {
    /// Renders every format, shaping subtitle cues by `layout`
    pub fn render(transcript: Transcript, layout: &SubtitleLayout) -> Self {
        SubmitResultRequest {
            as_txt: transcript.to_txt(),
            as_srt: transcript.to_srt_with(layout),
            as_vtt: transcript.to_vtt_with(layout),
            as_tsv: transcript.to_tsv(),
            transcript,
        }
    }
}

impl From<Transcript> for SubmitResultRequest {
    fn from(transcript: Transcript) -> Self {
        Self::render(transcript, &SubtitleLayout::default())
    }
}

/// Error body returned by the backend on non-success statuses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}
