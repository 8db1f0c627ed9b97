//! Wren Core
//!
//! Core types shared by the Wren transcription runner and its backend client.
//!
//! This crate contains:
//! - Domain types: the job, its options, the lease, transcripts and failure reports
//! - DTOs: request and response bodies exchanged with the backend

pub mod domain;
pub mod dto;
