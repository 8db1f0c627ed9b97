//! Runner domain model
//!
//! Describes this runner to the backend at registration time.

use serde::{Deserialize, Serialize};

/// Attributes a runner announces when it registers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerAttributes {
    /// Human readable name shown to users of the backend
    pub name: String,

    /// Relative capability; higher priority runners get jobs first
    pub priority: u32,

    /// Version of the runner software
    pub version: String,

    /// Commit the runner was built from, "unknown" outside a checkout
    pub git_hash: String,

    /// Where the runner's source code is published
    pub source_code_url: String,
}
