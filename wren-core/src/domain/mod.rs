//! Core domain types
//!
//! These types describe the unit of work a runner processes and what it
//! reports back. They are shared between the protocol client (decoding) and
//! the runner (execution).

pub mod failure;
pub mod job;
pub mod lease;
pub mod options;
pub mod runner;
pub mod transcript;
