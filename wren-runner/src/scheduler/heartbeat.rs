//! Lease heartbeat
//!
//! While a job executes, a dedicated task renews its lease on a timer. The
//! task owns the `Lease`, hands it back when stopped, and cancels the
//! `lease_lost` token if the lease cannot be kept. Renewals are strictly
//! serialized: each call is awaited before the next tick is considered.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wren_client::HeartbeatOutcome;
use wren_core::domain::lease::Lease;

use crate::config::TimingConfig;
use crate::repository::JobRepository;

/// Lower bound for the heartbeat cadence
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Cadence that fits at least two renewal attempts into the lease TTL
///
/// Returns `min(configured, ttl / 3)`, never zero. A zero TTL (a lease that
/// is already due) leaves the configured cadence untouched.
pub fn effective_heartbeat_interval(configured: Duration, ttl: Duration) -> Duration {
    if ttl.is_zero() {
        return configured.max(MIN_HEARTBEAT_INTERVAL);
    }
    configured.min(ttl / 3).max(MIN_HEARTBEAT_INTERVAL)
}

/// Why the runner no longer holds a job's lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseLoss {
    /// The backend reports the lease as gone
    Expired,
    /// The backend revoked the job
    Revoked,
    /// Renewals kept failing with transient errors
    RenewalFailed { attempts: u32, last_error: String },
    /// The backend answered a renewal with something unexpected
    Rejected(String),
    /// The backend no longer accepts the runner's credentials
    Unauthorized(String),
    /// The heartbeat task itself died
    TaskFailed(String),
}

impl fmt::Display for LeaseLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseLoss::Expired => write!(f, "lease expired"),
            LeaseLoss::Revoked => write!(f, "job aborted by backend"),
            LeaseLoss::RenewalFailed {
                attempts,
                last_error,
            } => write!(f, "{attempts} renewals failed, last: {last_error}"),
            LeaseLoss::Rejected(e) => write!(f, "renewal rejected: {e}"),
            LeaseLoss::Unauthorized(e) => write!(f, "unauthorized: {e}"),
            LeaseLoss::TaskFailed(e) => write!(f, "heartbeat task failed: {e}"),
        }
    }
}

/// What the heartbeat task hands back when it ends
#[derive(Debug)]
pub struct HeartbeatReport {
    /// Last lease held, `None` only if the task died
    pub lease: Option<Lease>,
    pub renewals: u32,
    pub loss: Option<LeaseLoss>,
}

/// Handle to a running heartbeat task
pub struct HeartbeatTask {
    stop: CancellationToken,
    handle: JoinHandle<HeartbeatReport>,
}

impl HeartbeatTask {
    /// Spawns the heartbeat task for a freshly claimed lease
    ///
    /// # Arguments
    /// * `repository` - Backend to renew against
    /// * `lease` - Lease returned by the claim, owned by the task from now on
    /// * `timing` - Heartbeat cadence and failure threshold
    /// * `progress` - Latest job progress, sent with each renewal
    /// * `lease_lost` - Cancelled by the task when the lease is lost
    pub fn spawn(
        repository: Arc<dyn JobRepository>,
        lease: Lease,
        timing: &TimingConfig,
        progress: watch::Receiver<f32>,
        lease_lost: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let heartbeat = Heartbeat {
            repository,
            configured: timing.heartbeat_interval,
            failure_threshold: timing.heartbeat_failure_threshold.max(1),
            progress,
            stop: stop.clone(),
            lease_lost,
        };

        let handle = tokio::spawn(heartbeat.run(lease));
        Self { stop, handle }
    }

    /// Stops the task and returns the final lease and its fate
    ///
    /// A renewal already in flight is allowed to finish first.
    pub async fn stop(self) -> HeartbeatReport {
        self.stop.cancel();
        match self.handle.await {
            Ok(report) => report,
            Err(e) => HeartbeatReport {
                lease: None,
                renewals: 0,
                loss: Some(LeaseLoss::TaskFailed(e.to_string())),
            },
        }
    }
}

struct Heartbeat {
    repository: Arc<dyn JobRepository>,
    configured: Duration,
    failure_threshold: u32,
    progress: watch::Receiver<f32>,
    stop: CancellationToken,
    lease_lost: CancellationToken,
}

impl Heartbeat {
    async fn run(self, mut lease: Lease) -> HeartbeatReport {
        let job_id = lease.job_id.clone();
        let mut period = effective_heartbeat_interval(self.configured, lease.ttl_from(Utc::now()));
        let mut ticker = ticker(period);
        let mut renewals = 0;
        let mut failures = 0;

        debug!("Heartbeat for job {} every {:?}", job_id, period);

        let loss = loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break None,
                _ = ticker.tick() => {}
            }

            let progress = *self.progress.borrow();
            match self.repository.heartbeat(&lease, progress).await {
                Ok(HeartbeatOutcome::Renewed(renewed)) => {
                    failures = 0;
                    renewals += 1;
                    debug!(
                        "Renewed lease on job {} until {} ({:.0}%)",
                        job_id, renewed.expires_at, progress
                    );

                    let next = effective_heartbeat_interval(
                        self.configured,
                        renewed.ttl_from(Utc::now()),
                    );
                    lease = renewed;
                    if next.abs_diff(period) > period / 10 {
                        debug!("Heartbeat for job {} now every {:?}", job_id, next);
                        period = next;
                        ticker = self::ticker(period);
                    }
                }
                Ok(HeartbeatOutcome::LeaseExpired) => break Some(LeaseLoss::Expired),
                Ok(HeartbeatOutcome::Aborted) => break Some(LeaseLoss::Revoked),
                Err(e) if e.is_auth_failure() => break Some(LeaseLoss::Unauthorized(e.to_string())),
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    warn!(
                        "Heartbeat for job {} failed ({}/{}): {}",
                        job_id, failures, self.failure_threshold, e
                    );
                    if failures >= self.failure_threshold {
                        break Some(LeaseLoss::RenewalFailed {
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                    if lease.is_expired(Utc::now()) {
                        break Some(LeaseLoss::Expired);
                    }
                }
                Err(e) => break Some(LeaseLoss::Rejected(e.to_string())),
            }
        };

        if let Some(loss) = &loss {
            warn!("Lost lease on job {}: {}", job_id, loss);
            self.lease_lost.cancel();
        }

        HeartbeatReport {
            lease: Some(lease),
            renewals,
            loss,
        }
    }
}

/// Interval whose first tick is one period from now
fn ticker(period: Duration) -> Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
