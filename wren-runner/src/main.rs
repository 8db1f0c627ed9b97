//! Wren Runner
//!
//! A worker that pulls transcription jobs from a backend and processes them
//! one at a time. All communication is initiated by the runner, so it works
//! behind NAT and firewalls without any inbound port.
//!
//! Architecture:
//! - Configuration: TOML file plus environment overlay, validated once
//! - Repositories: HTTP communication with the backend
//! - Services: Transcription engines (whisper.cpp command line, dummy)
//! - Scheduler: Polling, job lifecycle, lease heartbeats

mod config;
mod context;
mod repository;
mod scheduler;
mod service;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wren_client::{BackendClient, ClientOptions};
use wren_core::domain::runner::RunnerAttributes;

use crate::config::Config;
use crate::repository::JobRepository;
use crate::scheduler::{WorkerLoop, backoff_delay};
use crate::service::{
    DummyTranscriptionService, ModelStore, TranscriptionService, WhisperCliService,
};

#[derive(Debug, Parser)]
#[command(name = "wren-runner", version, about = "Transcription runner for a Wren backend")]
struct Cli {
    /// Config file to use instead of searching the default locations
    #[arg(long, env = "WREN_CONFIG")]
    config: Option<PathBuf>,

    /// Replace the transcription engine with a deterministic fake
    #[arg(long)]
    dummy: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wren_runner=info,wren_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        "Starting Wren Runner {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("WREN_GIT_HASH")
    );

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(
        "Loaded configuration: name={}, backend={}, device={}",
        config.runner.name, config.backend.url, config.engine.device
    );

    let client = Arc::new(build_client(&config)?);
    info!("Backend client initialized");

    let transcriber: Arc<dyn TranscriptionService> = if cli.dummy {
        warn!(
            "Dummy mode: jobs get canned transcripts after {:?}",
            config.engine.dummy_delay
        );
        Arc::new(DummyTranscriptionService::new(config.engine.dummy_delay))
    } else {
        let service = WhisperCliService::new(&config.engine);
        service
            .check_available()
            .context("Transcription engine is not usable")?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.backend.request_timeout)
            .user_agent(concat!("wren-runner/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create download client")?;
        ModelStore::from_config(&config.engine)
            .prepare(config.engine.model_prefetching, &http)
            .await
            .context("Failed to prepare model cache")?;

        Arc::new(service)
    };

    let attributes = RunnerAttributes {
        name: config.runner.name.clone(),
        priority: config.runner.priority,
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("WREN_GIT_HASH").to_string(),
        source_code_url: config.runner.source_code_url.clone(),
    };
    info!("Registering with backend");
    register_with_retry(&client, &attributes).await?;
    info!("Registered successfully");

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, finishing current work");
        trigger.cancel();
    });

    let repository: Arc<dyn JobRepository> = client.clone();
    let mut worker = WorkerLoop::new(
        repository,
        transcriber,
        config.timing,
        config.engine.work_dir.clone(),
        shutdown,
    );

    let result = worker.run().await;
    let stats = worker.stats();
    info!(
        "Worker loop stopped: {} polls, {} completed, {} failed, {} dropped, {} aborted",
        stats.polls, stats.completed, stats.failed, stats.dropped, stats.aborted
    );

    if let Err(e) = result {
        error!("Runner stopped: {}", e);
        return Err(e.into());
    }

    if let Err(e) = client.unregister().await {
        warn!("Failed to unregister from backend: {}", e);
    }
    info!("Runner stopped");

    Ok(())
}

/// Builds the HTTP client from the backend settings
fn build_client(config: &Config) -> Result<BackendClient> {
    let mut options = ClientOptions::with_timeout(config.backend.request_timeout);
    if let Some(path) = &config.backend.ca_pem_file {
        let pem = std::fs::read(path)
            .with_context(|| format!("Failed to read CA certificate {}", path.display()))?;
        options.ca_certificate_pem = Some(pem);
    }

    BackendClient::new(
        config.backend.url.clone(),
        config.backend.auth_token.expose(),
        options,
    )
    .context("Failed to create backend client")
}

/// Register with the backend with retry logic and exponential backoff
///
/// This handles the case where the backend may not be ready yet when the
/// runner starts. Rejected credentials are not retried.
async fn register_with_retry(client: &BackendClient, attributes: &RunnerAttributes) -> Result<()> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY: Duration = Duration::from_millis(500);
    const MAX_DELAY: Duration = Duration::from_secs(30);

    let mut attempt = 0;

    loop {
        attempt += 1;

        match client.register(attributes).await {
            Ok(()) => {
                if attempt > 1 {
                    info!(
                        "Successfully registered with backend after {} attempt(s)",
                        attempt
                    );
                }
                return Ok(());
            }
            Err(e) if e.is_auth_failure() => {
                return Err(anyhow::anyhow!("Backend rejected the runner token: {}", e));
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to register with backend after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!("Failed to register with backend: {}", e));
                }

                let delay = backoff_delay(attempt - 1, INITIAL_DELAY, MAX_DELAY);
                warn!(
                    "Failed to register with backend (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {:?}...", delay);

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
