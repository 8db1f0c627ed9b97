//! Repository layer
//!
//! Repositories abstract communication with the backend. They expose the
//! protocol vocabulary the scheduler needs without any policy: retries,
//! backoff and cancellation live in the scheduler.
//!
//! All repositories are trait-based so the scheduler can be driven by a
//! scripted backend in tests.

mod jobs;

pub use jobs::JobRepository;
