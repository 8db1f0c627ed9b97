//! Job lease
//!
//! A lease is the backend's promise that this runner owns a job until
//! `expires_at`, unless it is renewed with a heartbeat first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::job::JobId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub expires_at: DateTime<Utc>,
    /// Opaque token echoed back on the next renewal
    pub renewal_token: String,
}

impl Lease {
    /// Time left before the lease lapses, zero if it already has
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Lifetime granted by the backend, measured from `issued_at`
    ///
    /// Used to derive the heartbeat cadence right after a claim or renewal.
    pub fn ttl_from(&self, issued_at: DateTime<Utc>) -> Duration {
        self.remaining(issued_at)
    }
}
