//! Scheduler layer for the runner
//!
//! This layer polls the backend for jobs and drives each one through its
//! lifecycle: claim, heartbeat-protected execution, and submission of the
//! outcome. Only one job is held at a time.

pub mod backoff;
pub mod heartbeat;
pub mod lifecycle;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::backoff_delay;
pub use lifecycle::FatalError;
pub use worker::WorkerLoop;
