//! Scripted backend and engine for scheduler tests
//!
//! `ScriptedRepository` answers each call from a per-operation queue and
//! falls back to a well-behaved default once the queue is empty. Every call
//! is recorded with the (tokio) time it happened.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wren_client::{Ack, ClaimOutcome, ClientError, HeartbeatOutcome, PollOutcome};
use wren_core::domain::failure::FailureReport;
use wren_core::domain::job::{AudioRef, Job, JobId};
use wren_core::domain::lease::Lease;
use wren_core::domain::options::TranscriptionOptions;
use wren_core::domain::transcript::{Segment, Transcript};
use wren_core::dto::job::SubmitResultRequest;

use crate::repository::JobRepository;
use crate::service::{
    TranscriptionContext, TranscriptionFailure, TranscriptionRequest, TranscriptionService,
};

/// Origin the scripted backend claims as its own
pub const BACKEND_ORIGIN: &str = "https://backend.test";

type Scripted<T> = Mutex<VecDeque<wren_client::Result<T>>>;

#[derive(Debug, Clone)]
pub enum Call {
    Poll,
    Claim(JobId),
    Heartbeat {
        job_id: JobId,
        progress: f32,
        /// Time since the lease being renewed was granted
        since_grant: Duration,
    },
    FetchAudio(JobId),
    SubmitResult(JobId, SubmitResultRequest),
    SubmitFailure(FailureReport),
}

pub struct ScriptedRepository {
    polls: Scripted<PollOutcome>,
    claims: Scripted<ClaimOutcome>,
    heartbeats: Scripted<HeartbeatOutcome>,
    audio: Scripted<Vec<u8>>,
    submissions: Scripted<Ack>,
    lease_ttl: Duration,
    shutdown_when_idle: Option<CancellationToken>,
    shutdown_during_poll: Option<CancellationToken>,
    last_grant: Mutex<Instant>,
    tokens: AtomicU32,
    calls: Mutex<Vec<(Instant, Call)>>,
}

impl ScriptedRepository {
    pub fn new() -> Self {
        Self {
            polls: Mutex::default(),
            claims: Mutex::default(),
            heartbeats: Mutex::default(),
            audio: Mutex::default(),
            submissions: Mutex::default(),
            lease_ttl: Duration::from_secs(60),
            shutdown_when_idle: None,
            shutdown_during_poll: None,
            last_grant: Mutex::new(Instant::now()),
            tokens: AtomicU32::new(0),
            calls: Mutex::default(),
        }
    }

    pub fn with_polls(self, polls: Vec<wren_client::Result<PollOutcome>>) -> Self {
        *self.polls.lock().unwrap() = polls.into();
        self
    }

    pub fn with_claims(self, claims: Vec<wren_client::Result<ClaimOutcome>>) -> Self {
        *self.claims.lock().unwrap() = claims.into();
        self
    }

    pub fn with_heartbeats(self, heartbeats: Vec<wren_client::Result<HeartbeatOutcome>>) -> Self {
        *self.heartbeats.lock().unwrap() = heartbeats.into();
        self
    }

    pub fn with_audio(self, audio: Vec<wren_client::Result<Vec<u8>>>) -> Self {
        *self.audio.lock().unwrap() = audio.into();
        self
    }

    pub fn with_submissions(self, submissions: Vec<wren_client::Result<Ack>>) -> Self {
        *self.submissions.lock().unwrap() = submissions.into();
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Cancels `token` as soon as a poll finds the script exhausted
    pub fn shutdown_when_idle(mut self, token: CancellationToken) -> Self {
        self.shutdown_when_idle = Some(token);
        self
    }

    /// Cancels `token` while every poll is in flight, before it answers
    pub fn shutdown_during_poll(mut self, token: CancellationToken) -> Self {
        self.shutdown_during_poll = Some(token);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    /// Instants of all polls, in order
    pub fn poll_times(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, call)| matches!(call, Call::Poll))
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn heartbeats(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Heartbeat { .. }))
            .collect()
    }

    /// All submit-result and submit-failure calls, in order
    pub fn submissions(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::SubmitResult(..) | Call::SubmitFailure(_)))
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }

    fn grant(&self, job_id: &JobId) -> Lease {
        *self.last_grant.lock().unwrap() = Instant::now();
        let n = self.tokens.fetch_add(1, Ordering::SeqCst);
        Lease {
            job_id: job_id.clone(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.lease_ttl).unwrap_or(chrono::Duration::zero()),
            renewal_token: format!("renewal-{n}"),
        }
    }

    fn next<T>(queue: &Scripted<T>) -> Option<wren_client::Result<T>> {
        queue.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl JobRepository for ScriptedRepository {
    async fn poll_for_job(&self) -> wren_client::Result<PollOutcome> {
        self.record(Call::Poll);
        if let Some(token) = &self.shutdown_during_poll {
            token.cancel();
        }
        match Self::next(&self.polls) {
            Some(outcome) => outcome,
            None => {
                if let Some(token) = &self.shutdown_when_idle {
                    token.cancel();
                }
                Ok(PollOutcome::NoJobAvailable)
            }
        }
    }

    async fn claim(&self, job_id: &JobId) -> wren_client::Result<ClaimOutcome> {
        self.record(Call::Claim(job_id.clone()));
        Self::next(&self.claims).unwrap_or_else(|| Ok(ClaimOutcome::Leased(self.grant(job_id))))
    }

    async fn heartbeat(&self, lease: &Lease, progress: f32) -> wren_client::Result<HeartbeatOutcome> {
        let since_grant = self.last_grant.lock().unwrap().elapsed();
        self.record(Call::Heartbeat {
            job_id: lease.job_id.clone(),
            progress,
            since_grant,
        });
        Self::next(&self.heartbeats)
            .unwrap_or_else(|| Ok(HeartbeatOutcome::Renewed(self.grant(&lease.job_id))))
    }

    async fn fetch_audio(&self, job: &Job) -> wren_client::Result<Vec<u8>> {
        self.record(Call::FetchAudio(job.id.clone()));
        Self::next(&self.audio).unwrap_or_else(|| Ok(b"RIFF synthetic audio".to_vec()))
    }

    fn sends_credentials(&self, audio: &AudioRef) -> bool {
        !audio.is_absolute() || audio.as_str().starts_with(&format!("{BACKEND_ORIGIN}/"))
    }

    async fn submit_result(
        &self,
        job_id: &JobId,
        result: &SubmitResultRequest,
    ) -> wren_client::Result<Ack> {
        self.record(Call::SubmitResult(job_id.clone(), result.clone()));
        Self::next(&self.submissions).unwrap_or(Ok(Ack::Accepted))
    }

    async fn submit_failure(&self, report: &FailureReport) -> wren_client::Result<Ack> {
        self.record(Call::SubmitFailure(report.clone()));
        Self::next(&self.submissions).unwrap_or(Ok(Ack::Accepted))
    }
}

pub fn job(id: &str) -> Job {
    Job {
        id: JobId::new(id),
        audio: AudioRef::new(format!("/api/runners/jobs/{id}/audio")),
        options: TranscriptionOptions::default(),
        assigned_at: Utc::now(),
    }
}

pub fn server_error() -> ClientError {
    ClientError::from_status(504, "gateway timeout")
}

pub fn unauthorized() -> ClientError {
    ClientError::from_status(401, "invalid runner token")
}

pub fn sample_transcript() -> Transcript {
    Transcript::new(vec![Segment::new(0.0, 1.25, "Hello from the stub.")], "en")
}

/// Engine stub that sleeps for a fixed time and returns a fixed outcome
pub struct StubTranscriber {
    delay: Duration,
    cooperative: bool,
    outcome: Result<Transcript, TranscriptionFailure>,
    calls: AtomicU32,
}

impl StubTranscriber {
    pub fn succeeding(delay: Duration) -> Self {
        Self {
            delay,
            cooperative: true,
            outcome: Ok(sample_transcript()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(delay: Duration, failure: TranscriptionFailure) -> Self {
        Self {
            outcome: Err(failure),
            ..Self::succeeding(delay)
        }
    }

    /// Ignores the cancellation token and always runs for the full delay
    pub fn non_cooperative(mut self) -> Self {
        self.cooperative = false;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TranscriptionService for StubTranscriber {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports_cancellation(&self) -> bool {
        self.cooperative
    }

    fn transcribe(
        &self,
        _request: &TranscriptionRequest,
        ctx: &TranscriptionContext,
    ) -> Result<Transcript, TranscriptionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = std::time::Instant::now();
        while started.elapsed() < self.delay {
            if self.cooperative && ctx.is_cancelled() {
                return Err(TranscriptionFailure::Cancelled);
            }
            ctx.progress
                .report(started.elapsed().as_secs_f32() * 100.0 / self.delay.as_secs_f32());
            std::thread::sleep(Duration::from_millis(2));
        }
        ctx.progress.report(100.0);
        self.outcome.clone()
    }
}
