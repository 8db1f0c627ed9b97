//! Exponential backoff
//!
//! Delays double with every consecutive failure, starting from a base and
//! capped at a ceiling. Used for polling, submissions and registration.

use std::time::Duration;

/// Delay before the next attempt after `attempt` consecutive failures
///
/// `attempt == 0` yields `base`, every further failure doubles the delay
/// until it reaches `ceiling`.
pub fn backoff_delay(attempt: u32, base: Duration, ceiling: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(ceiling).min(ceiling)
}

/// Poll pacing for the worker loop
///
/// Steady state (successful polls) uses the base interval; consecutive
/// failures back off exponentially until the next success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            failures: 0,
        }
    }

    /// Records a successful call and returns the steady-state delay
    pub fn succeeded(&mut self) -> Duration {
        self.failures = 0;
        self.base.min(self.ceiling)
    }

    /// Records a failed call and returns the delay before retrying
    pub fn failed(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        backoff_delay(self.failures, self.base, self.ceiling)
    }

    /// Consecutive failures since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
