//! Runner DTOs
//!
//! Data transfer objects for runner registration.

use serde::{Deserialize, Serialize};

use crate::domain::runner::RunnerAttributes;

/// Request to register a runner with the backend
///
/// The backend identifies the runner by its bearer token; the attributes are
/// informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunner {
    #[serde(flatten)]
    pub attributes: RunnerAttributes,
}
