//! whisper.cpp command line adapter
//!
//! Drives an external `whisper-cli` binary:
//! - Normalizing the input to 16 kHz mono WAV with ffmpeg
//! - Running the model from the local model cache, with the job's decoding
//!   and voice activity settings
//! - Forwarding the engine's progress output
//! - Killing the child process when the job is cancelled
//! - Parsing the JSON transcript it writes next to the audio

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};
use wren_core::domain::options::{Task, TranscriptionOptions};
use wren_core::domain::transcript::{Segment, Transcript};

use super::models::ModelStore;
use super::transcription::{
    TranscriptionContext, TranscriptionFailure, TranscriptionRequest, TranscriptionService,
};
use crate::config::EngineConfig;

/// How often a running child is checked for exit or cancellation
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Stderr lines kept for error messages
const STDERR_TAIL_LINES: usize = 8;

/// A canonical 16-bit PCM WAV header without any samples
const WAV_HEADER_LEN: u64 = 44;

/// Tokens matching this are suppressed when numerals are unwanted
const NUMERAL_TOKENS: &str = ".*[0-9%$£€].*";

/// Adapter for a whisper.cpp compatible command line engine
pub struct WhisperCliService {
    command: String,
    ffmpeg_command: String,
    models: ModelStore,
    vad_model: Option<PathBuf>,
    device: String,
}

struct ProcessOutput {
    status: ExitStatus,
    stderr_tail: Vec<String>,
}

impl ProcessOutput {
    fn stderr_summary(&self) -> String {
        if self.stderr_tail.is_empty() {
            format!("exited with {}", self.status)
        } else {
            self.stderr_tail.join("; ")
        }
    }
}

impl WhisperCliService {
    pub fn new(engine: &EngineConfig) -> Self {
        Self {
            command: engine.command.clone(),
            ffmpeg_command: engine.ffmpeg_command.clone(),
            models: ModelStore::from_config(engine),
            vad_model: engine.vad_model.clone(),
            device: engine.device.clone(),
        }
    }

    /// Checks that both binaries can be started and a configured VAD model exists
    ///
    /// Model weights are handled separately by [`ModelStore::prepare`].
    pub fn check_available(&self) -> Result<()> {
        Command::new(&self.command)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.command))?;

        let output = Command::new(&self.ffmpeg_command)
            .arg("-version")
            .output()
            .with_context(|| {
                format!("Failed to execute '{}'. Is it installed?", self.ffmpeg_command)
            })?;
        if !output.status.success() {
            anyhow::bail!("{} is not working correctly", self.ffmpeg_command);
        }

        match &self.vad_model {
            Some(path) if !path.is_file() => {
                anyhow::bail!("VAD model {} does not exist", path.display());
            }
            Some(path) => info!("Voice activity detection uses {}", path.display()),
            None => info!("No VAD model configured, jobs requesting VAD will be rejected"),
        }

        info!("Engine '{}' available, device {}", self.command, self.device);
        Ok(())
    }

    /// Rejects settings this engine has no way to honor
    fn check_supported(&self, options: &TranscriptionOptions) -> Result<(), TranscriptionFailure> {
        if options.diarization.is_some() {
            return Err(TranscriptionFailure::UnsupportedOptions(
                "speaker diarization is not available with whisper-cli".to_string(),
            ));
        }
        if options.subtitle_layout().highlight_words {
            return Err(TranscriptionFailure::UnsupportedOptions(
                "word highlighting needs word timings, which whisper-cli does not report"
                    .to_string(),
            ));
        }
        if options.vad.is_some() && self.vad_model.is_none() {
            return Err(TranscriptionFailure::UnsupportedOptions(
                "voice activity detection requested, but this runner has no VAD model"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn normalize_audio(
        &self,
        input: &Path,
        output: &Path,
        ctx: &TranscriptionContext,
    ) -> Result<(), TranscriptionFailure> {
        let mut command = Command::new(&self.ffmpeg_command);
        command
            .args(["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(input)
            .args(["-ar", "16000", "-ac", "1", "-c:a", "pcm_s16le"])
            .arg(output);

        let result = run_cancellable(command, ctx, |_| {})?;
        if !result.status.success() {
            return Err(classify_ffmpeg_failure(&result.stderr_summary()));
        }

        let len = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        if len <= WAV_HEADER_LEN {
            return Err(TranscriptionFailure::CorruptedInput(
                "audio contains no samples".to_string(),
            ));
        }

        Ok(())
    }
}

impl TranscriptionService for WhisperCliService {
    fn name(&self) -> &'static str {
        "whisper-cli"
    }

    fn supports_cancellation(&self) -> bool {
        true
    }

    fn transcribe(
        &self,
        request: &TranscriptionRequest,
        ctx: &TranscriptionContext,
    ) -> Result<Transcript, TranscriptionFailure> {
        self.check_supported(&request.options)?;

        let model_path = self.models.path(request.options.model);
        if !model_path.is_file() {
            return Err(TranscriptionFailure::Engine(format!(
                "model {} not found at {}",
                request.options.model,
                model_path.display()
            )));
        }

        let dir = request
            .audio_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let wav = dir.join("normalized.wav");
        let out_prefix = dir.join("transcript");

        debug!("Normalizing audio for job {}", request.job_id);
        self.normalize_audio(&request.audio_path, &wav, ctx)?;

        let mut command = Command::new(&self.command);
        command.args(whisper_args(
            &model_path,
            &wav,
            &out_prefix,
            &request.options,
            &self.device,
            self.vad_model.as_deref(),
        ));

        info!(
            "Running {} with model {} for job {}",
            self.command, request.options.model, request.job_id
        );
        let result = run_cancellable(command, ctx, |line| {
            if let Some(percent) = parse_progress(line) {
                ctx.progress.report(percent);
            }
        })?;

        if !result.status.success() {
            let summary = result.stderr_summary();
            if summary.contains("unknown language") {
                return Err(TranscriptionFailure::UnsupportedOptions(summary));
            }
            return Err(TranscriptionFailure::Engine(summary));
        }

        let json_path = out_prefix.with_extension("json");
        let raw = std::fs::read_to_string(&json_path).map_err(|e| {
            TranscriptionFailure::Engine(format!(
                "engine output {} unreadable: {}",
                json_path.display(),
                e
            ))
        })?;

        parse_whisper_json(&raw, request.options.language.as_deref())
    }
}

/// Runs a child process to completion unless `ctx` is cancelled first
///
/// Stderr is read on a scoped thread and handed line by line to `on_line`;
/// the last few lines are kept for error reporting.
fn run_cancellable(
    mut command: Command,
    ctx: &TranscriptionContext,
    mut on_line: impl FnMut(&str) + Send,
) -> Result<ProcessOutput, TranscriptionFailure> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command.spawn().map_err(|e| {
        TranscriptionFailure::Engine(format!("failed to start {program}: {e}"))
    })?;
    let stderr = child.stderr.take();

    std::thread::scope(|scope| {
        let reader = scope.spawn(move || {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            if let Some(stderr) = stderr {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    on_line(&line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Vec::from(tail)
        });

        let status = loop {
            if ctx.is_cancelled() {
                warn!("Cancelling {} (pid {})", program, child.id());
                if let Err(e) = child.kill() {
                    warn!("Failed to kill {}: {}", program, e);
                }
                if let Err(e) = child.wait() {
                    warn!("Failed to reap {}: {}", program, e);
                }
                return Err(TranscriptionFailure::Cancelled);
            }

            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(WAIT_POLL),
                Err(e) => {
                    if let Err(kill_err) = child.kill() {
                        warn!("Failed to kill {}: {}", program, kill_err);
                    }
                    let _ = child.wait();
                    return Err(TranscriptionFailure::Engine(format!(
                        "failed to wait for {program}: {e}"
                    )));
                }
            }
        };

        let stderr_tail = reader.join().unwrap_or_default();
        Ok(ProcessOutput {
            status,
            stderr_tail,
        })
    })
}

/// Builds the whisper-cli argument list
///
/// `vad_model` is only used when the job asks for voice activity detection.
fn whisper_args(
    model: &Path,
    audio: &Path,
    out_prefix: &Path,
    options: &TranscriptionOptions,
    device: &str,
    vad_model: Option<&Path>,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-m".into(),
        model.into(),
        "-f".into(),
        audio.into(),
        "-oj".into(),
        "-of".into(),
        out_prefix.into(),
        "-pp".into(),
        "-l".into(),
        options.language.as_deref().unwrap_or("auto").into(),
    ];

    if options.task == Task::Translate {
        args.push("-tr".into());
    }
    if device == "cpu" {
        args.push("-ng".into());
    }

    let asr = &options.asr;
    let mut flag = |name: &str, value: String| {
        args.push(name.into());
        args.push(value.into());
    };
    flag("-bs", asr.beam_size.to_string());
    flag("-tp", asr.temperature.to_string());
    flag("-tpi", asr.temperature_increment_on_fallback.to_string());
    flag("-et", asr.compression_ratio_threshold.to_string());
    flag("-lpt", asr.log_prob_threshold.to_string());
    flag("-nth", asr.no_speech_threshold.to_string());
    if let Some(prompt) = &asr.initial_prompt {
        flag("--prompt", prompt.clone());
    }
    if asr.suppress_numerals {
        flag("--suppress-regex", NUMERAL_TOKENS.to_string());
    }

    if let (Some(vad), Some(vad_model)) = (&options.vad, vad_model) {
        args.push("--vad".into());
        args.push("-vm".into());
        args.push(vad_model.into());
        args.push("-vt".into());
        args.push(vad.vad_onset.to_string().into());
        args.push("-vmsd".into());
        args.push(vad.chunk_size.to_string().into());
    }

    args
}

/// Extracts the percentage from a whisper.cpp progress line
///
/// e.g. "whisper_print_progress_callback: progress =  45%"
fn parse_progress(line: &str) -> Option<f32> {
    let (_, rest) = line.split_once("progress =")?;
    rest.trim().trim_end_matches('%').trim().parse().ok()
}

fn classify_ffmpeg_failure(detail: &str) -> TranscriptionFailure {
    let lower = detail.to_lowercase();
    if lower.contains("truncat") || lower.contains("partial file") || lower.contains("corrupt") {
        TranscriptionFailure::CorruptedInput(detail.to_string())
    } else {
        TranscriptionFailure::UnsupportedFormat(detail.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    result: Option<WhisperResult>,
    transcription: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperResult {
    language: String,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    offsets: WhisperOffsets,
    text: String,
}

/// Segment bounds in milliseconds
#[derive(Debug, Deserialize)]
struct WhisperOffsets {
    from: u64,
    to: u64,
}

/// Converts whisper.cpp's `-oj` output into a transcript
fn parse_whisper_json(
    raw: &str,
    requested_language: Option<&str>,
) -> Result<Transcript, TranscriptionFailure> {
    let output: WhisperOutput = serde_json::from_str(raw)
        .map_err(|e| TranscriptionFailure::Engine(format!("malformed engine output: {e}")))?;

    let segments = output
        .transcription
        .into_iter()
        .map(|s| {
            Segment::new(
                s.offsets.from as f64 / 1000.0,
                s.offsets.to as f64 / 1000.0,
                s.text.trim(),
            )
        })
        .collect();

    let language = output
        .result
        .map(|r| r.language)
        .or_else(|| requested_language.map(str::to_string))
        .unwrap_or_else(|| "und".to_string());

    Ok(Transcript::new(segments, language))
}
