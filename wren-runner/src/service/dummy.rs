//! Dummy transcription service
//!
//! Stands in for a real engine during integration testing (`--dummy`). It
//! checks the audio file like an engine would, pretends to work for a fixed
//! time while reporting progress, and returns one of a few canned
//! transcripts. The choice is keyed by a SHA-256 digest of the audio bytes
//! and options, so the same input always yields the same transcript.

use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;
use wren_core::domain::options::TranscriptionOptions;
use wren_core::domain::transcript::{Segment, Transcript};

use super::transcription::{
    TranscriptionContext, TranscriptionFailure, TranscriptionRequest, TranscriptionService,
};

const PROGRESS_STEPS: u32 = 20;

/// (start, end, text) triples of a canned transcript
type CannedScript = &'static [(f64, f64, &'static str)];

const CANNED_SCRIPTS: [CannedScript; 3] = [
    &[
        (0.48, 3.92, "The quick brown fox jumps over the lazy dog."),
        (4.10, 7.85, "Pack my box with five dozen liquor jugs."),
    ],
    &[
        (1.20, 5.64, "Good morning, and welcome to the weekly status meeting."),
        (5.90, 9.02, "Let's start with a quick round of updates."),
        (9.40, 14.77, "Please keep it short, we have a lot to cover today."),
    ],
    &[
        (0.00, 2.35, "Testing, one, two, three."),
        (2.80, 6.11, "If you can hear this, the dummy runner is working."),
    ],
];

/// Deterministic fake engine
pub struct DummyTranscriptionService {
    delay: Duration,
}

impl DummyTranscriptionService {
    /// Creates a dummy service
    ///
    /// # Arguments
    /// * `delay` - Simulated processing time per job
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl TranscriptionService for DummyTranscriptionService {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn supports_cancellation(&self) -> bool {
        true
    }

    fn transcribe(
        &self,
        request: &TranscriptionRequest,
        ctx: &TranscriptionContext,
    ) -> Result<Transcript, TranscriptionFailure> {
        let audio = std::fs::read(&request.audio_path).map_err(|e| {
            TranscriptionFailure::UnsupportedFormat(format!(
                "cannot read {}: {}",
                request.audio_path.display(),
                e
            ))
        })?;

        if audio.is_empty() {
            return Err(TranscriptionFailure::CorruptedInput(
                "audio file is empty".to_string(),
            ));
        }

        let step = self.delay / PROGRESS_STEPS;
        for i in 1..=PROGRESS_STEPS {
            if ctx.is_cancelled() {
                debug!("Dummy transcription of job {} cancelled", request.job_id);
                return Err(TranscriptionFailure::Cancelled);
            }
            std::thread::sleep(step);
            ctx.progress
                .report(i as f32 * 100.0 / PROGRESS_STEPS as f32);
        }

        let digest = input_digest(&audio, &request.options);
        debug!(
            "Dummy transcript for job {} keyed by {}",
            request.job_id,
            digest.iter().map(|b| format!("{b:02x}")).collect::<String>()
        );
        Ok(canned_transcript(&digest, &request.options))
    }
}

/// SHA-256 over the audio and every option that shapes the transcript
fn input_digest(audio: &[u8], options: &TranscriptionOptions) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(audio);
    hasher.update([0]);
    hasher.update(options.model.as_str());
    hasher.update([0]);
    hasher.update(options.task.to_string());
    hasher.update([0]);
    hasher.update(options.language.as_deref().unwrap_or_default());
    hasher.finalize().into()
}

/// Picks and builds the canned transcript for the given input
fn canned_transcript(digest: &[u8; 32], options: &TranscriptionOptions) -> Transcript {
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let choice = u64::from_be_bytes(head) % CANNED_SCRIPTS.len() as u64;

    let segments = CANNED_SCRIPTS[choice as usize]
        .iter()
        .map(|&(start, end, text)| Segment::new(start, end, text))
        .collect();

    let language = options.language.as_deref().unwrap_or("en");
    Transcript::new(segments, language)
}
