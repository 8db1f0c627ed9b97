//! Wren HTTP Client
//!
//! A small, typed HTTP client for the outbound protocol between a Wren runner
//! and the transcription backend.
//!
//! Every call is initiated by the runner, carries the runner's bearer token
//! and is bounded by the client's request timeout. Responses are decoded into
//! protocol outcomes (for example [`ClaimOutcome::AlreadyClaimed`]) where the
//! backend signals an expected race, and into a classified [`ClientError`]
//! everywhere else.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use wren_client::{BackendClient, ClientOptions, PollOutcome};
//!
//! # async fn example() -> wren_client::Result<()> {
//! let client = BackendClient::new(
//!     "https://backend.example.org",
//!     "runner-token",
//!     ClientOptions::with_timeout(Duration::from_secs(30)),
//! )?;
//!
//! if let PollOutcome::Job(job) = client.poll_for_job().await? {
//!     println!("got job {}", job.id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
mod jobs;
mod runners;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use jobs::{Ack, ClaimOutcome, HeartbeatOutcome, PollOutcome};

use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use wren_core::dto::job::ErrorResponse;

/// Settings applied to the underlying HTTP client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Upper bound for every request, connection included
    pub timeout: Duration,
    /// Extra PEM encoded root certificate to trust (self-signed backends)
    pub ca_certificate_pem: Option<Vec<u8>>,
}

impl ClientOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ca_certificate_pem: None,
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }
}

/// HTTP client for the backend's runner API
///
/// Operations are grouped by concern:
/// - Runner registration (register, unregister)
/// - Job lifecycle (poll, claim, heartbeat, fetch audio, submit result/failure)
#[derive(Clone)]
pub struct BackendClient {
    /// Base URL of the backend (e.g., "https://backend.example.org")
    base_url: String,
    /// Bearer token identifying this runner
    token: String,
    /// HTTP client instance
    client: Client,
}

impl BackendClient {
    /// Create a new backend client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the backend API
    /// * `token` - The runner's bearer token
    /// * `options` - Timeout and TLS settings
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.timeout)
            .user_agent(concat!("wren-runner/", env!("CARGO_PKG_VERSION")));

        if let Some(pem) = &options.ca_certificate_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| ClientError::Configuration(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| ClientError::Configuration(e.to_string()))?;

        Ok(Self::with_client(base_url, token, client))
    }

    /// Create a new backend client with a preconfigured HTTP client
    pub fn with_client(base_url: impl Into<String>, token: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        }
    }

    /// Get the base URL of the backend
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Joins an API path onto the base URL
    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Whether `url` points at the backend itself
    ///
    /// Compares scheme, host and port after parsing, so a host that merely
    /// shares a text prefix with the backend does not match.
    fn is_backend_origin(&self, url: &str) -> bool {
        let (Ok(base), Ok(target)) = (Url::parse(&self.base_url), Url::parse(url)) else {
            return false;
        };

        base.scheme() == target.scheme()
            && base.host_str() == target.host_str()
            && base.port_or_known_default() == target.port_or_known_default()
    }

    /// Authenticated POST to an API path
    fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(&self.token)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Turns a non-success response into a classified error
    ///
    /// Uses the backend's `{"detail": ...}` body as the message when present.
    async fn error_from_response(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        let message = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => err.detail,
            Err(_) if body.is_empty() => "no response body".to_string(),
            Err(_) => body,
        };

        ClientError::from_status(status, message)
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Decode(format!("failed to parse JSON response: {e}")))
    }

    /// Handle an API response that carries no content we care about
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        Ok(())
    }

    /// Checks a status the caller has a dedicated outcome for
    fn is(response: &reqwest::Response, status: StatusCode) -> bool {
        response.status() == status
    }
}

impl fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_server;

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> BackendClient {
        BackendClient::with_client(base_url, "secret", Client::new())
    }

    #[test]
    fn test_client_creation() {
        let client = BackendClient::new("http://localhost:8080", "t", ClientOptions::default())
            .unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        assert_eq!(client("http://localhost:8080/").base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_url_joining() {
        let client = client("http://localhost:8080");
        assert_eq!(client.url("/api/x"), "http://localhost:8080/api/x");
        assert_eq!(client.url("api/x"), "http://localhost:8080/api/x");
    }

    #[test]
    fn test_debug_redacts_token() {
        let debug = format!("{:?}", client("http://localhost:8080"));
        assert!(!debug.contains("secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_invalid_ca_certificate_rejected() {
        let options = ClientOptions {
            timeout: Duration::from_secs(1),
            ca_certificate_pem: Some(b"not a certificate".to_vec()),
        };
        let err = BackendClient::new("http://localhost:8080", "t", options).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
    }
}
