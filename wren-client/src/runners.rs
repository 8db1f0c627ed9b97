//! Runner-related API endpoints

use wren_core::domain::runner::RunnerAttributes;
use wren_core::dto::runner::RegisterRunner;

use crate::BackendClient;
use crate::error::Result;

impl BackendClient {
    // =============================================================================
    // Runner Registration & Lifecycle
    // =============================================================================

    /// Register this runner with the backend
    ///
    /// Must succeed before the backend assigns any job to the runner.
    ///
    /// # Example
    /// ```no_run
    /// # use wren_client::{BackendClient, ClientOptions};
    /// # use wren_core::domain::runner::RunnerAttributes;
    /// # async fn example() -> wren_client::Result<()> {
    /// let client = BackendClient::new("http://localhost:5000", "token", ClientOptions::default())?;
    /// client.register(&RunnerAttributes {
    ///     name: "lab runner 1".to_string(),
    ///     priority: 100,
    ///     version: "0.1.0".to_string(),
    ///     git_hash: "unknown".to_string(),
    ///     source_code_url: "https://git.example.org/wren/runner".to_string(),
    /// }).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn register(&self, attributes: &RunnerAttributes) -> Result<()> {
        let response = self
            .post("/api/runners/register")
            .json(&RegisterRunner {
                attributes: attributes.clone(),
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Tell the backend this runner is going offline
    pub async fn unregister(&self) -> Result<()> {
        let response = self.post("/api/runners/unregister").send().await?;

        self.handle_empty_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientOptions;
    use crate::test_server::{CannedResponse, TestServer};

    #[tokio::test]
    async fn test_register_sends_attributes() {
        let server = TestServer::start(vec![CannedResponse::empty(200)]).await;
        let client = BackendClient::new(server.base_url(), "tok", ClientOptions::default()).unwrap();

        client
            .register(&RunnerAttributes {
                name: "runner one".to_string(),
                priority: 7,
                version: "1.2.3".to_string(),
                git_hash: "0a1b2c3d".to_string(),
                source_code_url: "https://git.example.org/wren/runner".to_string(),
            })
            .await
            .unwrap();

        let requests = server.requests().await;
        assert!(requests[0].starts_with("POST /api/runners/register "));
        assert!(requests[0].contains(r#""name":"runner one""#));
        assert!(requests[0].contains(r#""priority":7"#));
        assert!(requests[0].contains(r#""git_hash":"0a1b2c3d""#));
        assert!(requests[0].contains(r#""source_code_url":"https://git.example.org/wren/runner""#));
    }

    #[tokio::test]
    async fn test_register_forbidden_is_auth_failure() {
        let server =
            TestServer::start(vec![CannedResponse::json(403, r#"{"detail":"unknown runner"}"#)])
                .await;
        let client = BackendClient::new(server.base_url(), "tok", ClientOptions::default()).unwrap();

        let err = client.register(&RunnerAttributes {
            name: "r".to_string(),
            priority: 1,
            version: "0".to_string(),
            git_hash: "unknown".to_string(),
            source_code_url: String::new(),
        })
        .await
        .unwrap_err();
        assert!(err.is_auth_failure());
    }
}
