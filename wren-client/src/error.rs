//! Error types for the Wren backend client
//!
//! Every failed call is classified once, here, into one of the categories the
//! runner's retry policy cares about.

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the backend
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection failure or timeout, the request may not have reached the backend
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// Backend returned a 5xx status
    #[error("backend error (status {status}): {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Error message from the backend
        message: String,
    },

    /// Backend rejected the runner's credentials
    #[error("authentication rejected (status {status}): {message}")]
    Unauthorized {
        /// HTTP status code
        status: u16,
        /// Error message from the backend
        message: String,
    },

    /// Backend returned a 4xx status the protocol does not expect
    #[error("protocol violation (status {status}): {message}")]
    Protocol {
        /// HTTP status code
        status: u16,
        /// Error message from the backend
        message: String,
    },

    /// Response body did not match the expected schema
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Client could not be constructed
    #[error("invalid client configuration: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Classifies a non-success status code
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Unauthorized { status, message },
            500..=599 => Self::Server { status, message },
            _ => Self::Protocol { status, message },
        }
    }

    /// Network failures and 5xx responses are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Server { .. })
    }

    /// No amount of retrying fixes rejected credentials
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// The backend's view of the job no longer matches the runner's
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::Decode(_))
    }

    /// HTTP status code, if the backend answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. }
            | Self::Unauthorized { status, .. }
            | Self::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err)
        }
    }
}
