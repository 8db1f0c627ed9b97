//! Service layer
//!
//! Transcription engines behind a common trait. The job lifecycle only sees
//! `TranscriptionService`; which implementation runs is decided once at
//! startup (`--dummy` or the whisper.cpp adapter).

mod dummy;
mod models;
mod transcription;
mod whisper_cli;

// Re-export traits and their vocabulary
pub use transcription::{
    ProgressReporter, TranscriptionContext, TranscriptionFailure, TranscriptionRequest,
    TranscriptionService,
};

// Re-export implementations
pub use dummy::DummyTranscriptionService;
pub use models::ModelStore;
pub use whisper_cli::WhisperCliService;
