//! Data Transfer Objects for runner/backend communication
//!
//! Request and response bodies as they travel over the wire. Domain types are
//! embedded directly where their serialized form is already the wire form.

pub mod job;
pub mod runner;
