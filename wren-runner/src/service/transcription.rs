//! Transcription service
//!
//! The speech-to-text engine seen from the job lifecycle: a synchronous,
//! long-running call that turns an audio file into a transcript. Callers run
//! it on a blocking thread and hand it a context for progress reporting and
//! cooperative cancellation.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wren_core::domain::failure::FailureKind;
use wren_core::domain::job::JobId;
use wren_core::domain::options::TranscriptionOptions;
use wren_core::domain::transcript::Transcript;

/// Input handed to the engine for one job
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub job_id: JobId,
    /// Audio file inside the job's working directory
    pub audio_path: PathBuf,
    pub options: TranscriptionOptions,
}

/// Publishes the progress of the running job, in percent
///
/// The latest value is picked up by the heartbeat task and sent along with
/// the next renewal.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: Arc<watch::Sender<f32>>,
}

impl ProgressReporter {
    pub fn new(sender: watch::Sender<f32>) -> Self {
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Creates a reporter together with the receiving end
    pub fn channel() -> (Self, watch::Receiver<f32>) {
        let (sender, receiver) = watch::channel(0.0);
        (Self::new(sender), receiver)
    }

    /// Reports progress, clamped to 0..=100
    pub fn report(&self, percent: f32) {
        let percent = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
        self.sender.send_replace(percent);
    }
}

/// Everything the engine may use besides its input
#[derive(Debug, Clone)]
pub struct TranscriptionContext {
    pub progress: ProgressReporter,
    /// Cancelled when the job's lease is lost
    pub cancel: CancellationToken,
}

impl TranscriptionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Why the engine did not produce a transcript
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranscriptionFailure {
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupted input: {0}")]
    CorruptedInput(String),

    #[error("unsupported options: {0}")]
    UnsupportedOptions(String),

    #[error("engine error: {0}")]
    Engine(String),

    /// Stopped early because the cancellation token fired
    #[error("transcription cancelled")]
    Cancelled,
}

impl TranscriptionFailure {
    /// Failure kind reported to the backend, `None` for cancellation
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            TranscriptionFailure::UnsupportedFormat(_) => Some(FailureKind::UnsupportedFormat),
            TranscriptionFailure::CorruptedInput(_) => Some(FailureKind::CorruptedInput),
            TranscriptionFailure::UnsupportedOptions(_) => Some(FailureKind::UnsupportedOptions),
            TranscriptionFailure::Engine(_) => Some(FailureKind::EngineError),
            TranscriptionFailure::Cancelled => None,
        }
    }
}

/// Service trait for speech-to-text engines
///
/// Implementations are shared across jobs but only ever run one
/// transcription at a time.
pub trait TranscriptionService: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    /// Whether `transcribe` observes `ctx.cancel` and returns early
    ///
    /// Non-cooperative engines run to completion and their result is
    /// discarded by the caller.
    fn supports_cancellation(&self) -> bool {
        false
    }

    /// Transcribes one audio file, blocking the calling thread
    ///
    /// # Arguments
    /// * `request` - Audio path and options of the job
    /// * `ctx` - Progress reporter and cancellation token
    fn transcribe(
        &self,
        request: &TranscriptionRequest,
        ctx: &TranscriptionContext,
    ) -> Result<Transcript, TranscriptionFailure>;
}
