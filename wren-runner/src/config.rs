//! Runner configuration
//!
//! Configuration is read once at startup from a TOML file, overlaid with a
//! few environment variables (so the token never has to live in the file),
//! validated, and then handed to the rest of the runner as an immutable
//! struct. Nothing outside this module reads files or the environment.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "wren-runner";

/// Environment variable holding the runner's bearer token
pub const TOKEN_ENV: &str = "WREN_RUNNER_TOKEN";

/// Bearer token, redacted from `Debug` output
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub runner: RunnerConfig,
    pub backend: BackendConfig,
    pub engine: EngineConfig,
    pub timing: TimingConfig,
}

/// How the runner presents itself to the backend
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Name shown to backend users, at most 40 characters
    pub name: String,
    /// Higher priority runners are offered jobs first
    pub priority: u32,
    /// Where the runner's source can be found, reported at registration
    pub source_code_url: String,
}

/// Backend connection settings
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend base URL (e.g., "https://backend.example.org")
    pub url: String,
    pub auth_token: AuthToken,
    /// Extra root certificate for self-signed backends
    pub ca_pem_file: Option<PathBuf>,
    /// Upper bound for any single request
    pub request_timeout: Duration,
}

/// Transcription engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where the engine keeps its downloaded models
    pub model_cache_dir: PathBuf,
    /// Compute device, e.g. "cuda" or "cpu"
    pub device: String,
    /// whisper.cpp compatible command line binary
    pub command: String,
    /// ffmpeg binary used to normalize input audio
    pub ffmpeg_command: String,
    /// Base directory for per-job working directories
    pub work_dir: PathBuf,
    /// Simulated processing time in dummy mode
    pub dummy_delay: Duration,
    /// What to do about missing models before registering
    pub model_prefetching: ModelPrefetching,
    /// Base URL the ggml model files are downloaded from
    pub model_download_url: String,
    /// Silero VAD model, needed for jobs that ask for voice activity detection
    pub vad_model: Option<PathBuf>,
}

/// Startup handling of models missing from the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelPrefetching {
    /// Download every missing model before taking jobs
    #[default]
    All,
    /// Only report missing models; jobs needing them fail
    None,
}

pub const DEFAULT_MODEL_DOWNLOAD_URL: &str =
    "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// Intervals and retry budgets of the worker loop and job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Sleep between polls while the queue is empty
    pub poll_interval: Duration,
    /// Ceiling for the backoff applied after failed polls
    pub max_poll_backoff: Duration,
    /// Preferred heartbeat cadence, shortened if the lease TTL demands it
    pub heartbeat_interval: Duration,
    /// Consecutive failed renewals after which the lease counts as lost
    pub heartbeat_failure_threshold: u32,
    /// Attempts for one submission (and for fetching audio) before giving up
    pub submit_max_attempts: u32,
    /// First delay between submission attempts, doubled on each retry
    pub submit_backoff_base: Duration,
    /// Ceiling for the submission backoff
    pub submit_backoff_max: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_poll_backoff: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_failure_threshold: 2,
            submit_max_attempts: 5,
            submit_backoff_base: Duration::from_secs(2),
            submit_backoff_max: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// File schema
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    runner: RunnerSection,
    backend: BackendSection,
    #[serde(default)]
    engine: EngineSection,
    #[serde(default)]
    timing: TimingSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunnerSection {
    name: String,
    #[serde(default = "default_priority")]
    priority: u32,
    #[serde(default)]
    source_code_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackendSection {
    url: String,
    #[serde(default)]
    auth_token: Option<String>,
    #[serde(default)]
    ca_pem_file: Option<PathBuf>,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EngineSection {
    model_cache_dir: Option<PathBuf>,
    device: Option<String>,
    command: Option<String>,
    ffmpeg_command: Option<String>,
    work_dir: Option<PathBuf>,
    dummy_delay_secs: Option<u64>,
    #[serde(default)]
    model_prefetching: ModelPrefetching,
    model_download_url: Option<String>,
    vad_model: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimingSection {
    poll_interval_secs: Option<u64>,
    max_poll_backoff_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    heartbeat_failure_threshold: Option<u32>,
    submit_max_attempts: Option<u32>,
    submit_backoff_base_secs: Option<u64>,
    submit_backoff_max_secs: Option<u64>,
}

fn default_priority() -> u32 {
    100
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_model_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME).join("models"))
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join(APP_NAME).join("jobs")
}

impl Config {
    /// Loads, overlays and validates the configuration
    ///
    /// # Arguments
    /// * `explicit_path` - Config file given on the command line, if any
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = match explicit_path {
            Some(path) => {
                if !path.is_file() {
                    anyhow::bail!("config file {} does not exist", path.display());
                }
                path.to_path_buf()
            }
            None => find_config_file(&default_search_paths())?,
        };

        tracing::info!("Loading config from {}", path.display());
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Parses the TOML file format, filling in defaults
    ///
    /// The token may be absent here and supplied by the environment later;
    /// [`Config::validate`] rejects a config that ends up without one.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(raw)?;
        let defaults = TimingConfig::default();
        let secs = Duration::from_secs;

        Ok(Self {
            runner: RunnerConfig {
                name: file.runner.name,
                priority: file.runner.priority,
                source_code_url: file
                    .runner
                    .source_code_url
                    .unwrap_or_else(|| env!("CARGO_PKG_REPOSITORY").to_string()),
            },
            backend: BackendConfig {
                url: file.backend.url.trim_end_matches('/').to_string(),
                auth_token: AuthToken::new(file.backend.auth_token.unwrap_or_default()),
                ca_pem_file: file.backend.ca_pem_file,
                request_timeout: secs(file.backend.request_timeout_secs),
            },
            engine: EngineConfig {
                model_cache_dir: file
                    .engine
                    .model_cache_dir
                    .unwrap_or_else(default_model_cache_dir),
                device: file.engine.device.unwrap_or_else(|| "cuda".to_string()),
                command: file
                    .engine
                    .command
                    .unwrap_or_else(|| "whisper-cli".to_string()),
                ffmpeg_command: file
                    .engine
                    .ffmpeg_command
                    .unwrap_or_else(|| "ffmpeg".to_string()),
                work_dir: file.engine.work_dir.unwrap_or_else(default_work_dir),
                dummy_delay: secs(file.engine.dummy_delay_secs.unwrap_or(3)),
                model_prefetching: file.engine.model_prefetching,
                model_download_url: file
                    .engine
                    .model_download_url
                    .unwrap_or_else(|| DEFAULT_MODEL_DOWNLOAD_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
                vad_model: file.engine.vad_model,
            },
            timing: TimingConfig {
                poll_interval: file
                    .timing
                    .poll_interval_secs
                    .map(secs)
                    .unwrap_or(defaults.poll_interval),
                max_poll_backoff: file
                    .timing
                    .max_poll_backoff_secs
                    .map(secs)
                    .unwrap_or(defaults.max_poll_backoff),
                heartbeat_interval: file
                    .timing
                    .heartbeat_interval_secs
                    .map(secs)
                    .unwrap_or(defaults.heartbeat_interval),
                heartbeat_failure_threshold: file
                    .timing
                    .heartbeat_failure_threshold
                    .unwrap_or(defaults.heartbeat_failure_threshold),
                submit_max_attempts: file
                    .timing
                    .submit_max_attempts
                    .unwrap_or(defaults.submit_max_attempts),
                submit_backoff_base: file
                    .timing
                    .submit_backoff_base_secs
                    .map(secs)
                    .unwrap_or(defaults.submit_backoff_base),
                submit_backoff_max: file
                    .timing
                    .submit_backoff_max_secs
                    .map(secs)
                    .unwrap_or(defaults.submit_backoff_max),
            },
        })
    }

    /// Overlays values from the environment
    ///
    /// Recognized variables:
    /// - WREN_RUNNER_TOKEN (bearer token)
    /// - WREN_BACKEND_URL
    /// - WREN_DEVICE
    /// - WREN_MODEL_CACHE_DIR
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(TOKEN_ENV).filter(|t| !t.is_empty()) {
            self.backend.auth_token = AuthToken::new(token);
        }
        if let Some(url) = lookup("WREN_BACKEND_URL").filter(|u| !u.is_empty()) {
            self.backend.url = url.trim_end_matches('/').to_string();
        }
        if let Some(device) = lookup("WREN_DEVICE").filter(|d| !d.is_empty()) {
            self.engine.device = device;
        }
        if let Some(dir) = lookup("WREN_MODEL_CACHE_DIR").filter(|d| !d.is_empty()) {
            self.engine.model_cache_dir = PathBuf::from(dir);
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        let name_len = self.runner.name.chars().count();
        if name_len == 0 || name_len > 40 {
            anyhow::bail!("runner.name must be between 1 and 40 characters");
        }

        if self.runner.priority == 0 {
            anyhow::bail!("runner.priority must be greater than 0");
        }

        if !is_http_url(&self.backend.url) {
            anyhow::bail!("backend.url must start with http:// or https://");
        }

        if !self.runner.source_code_url.is_empty() && !is_http_url(&self.runner.source_code_url) {
            anyhow::bail!("runner.source_code_url must start with http:// or https://");
        }

        if !is_http_url(&self.engine.model_download_url) {
            anyhow::bail!("engine.model_download_url must start with http:// or https://");
        }

        let token = self.backend.auth_token.expose();
        if token.is_empty() {
            anyhow::bail!("no runner token configured, set backend.auth_token or {TOKEN_ENV}");
        }
        if !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("runner token may only contain letters, digits, '_' and '-'");
        }

        if self.backend.request_timeout.is_zero() {
            anyhow::bail!("backend.request_timeout_secs must be greater than 0");
        }

        let timing = &self.timing;
        if timing.poll_interval.is_zero() {
            anyhow::bail!("timing.poll_interval_secs must be greater than 0");
        }
        if timing.max_poll_backoff < timing.poll_interval {
            anyhow::bail!("timing.max_poll_backoff_secs must not be below poll_interval_secs");
        }
        if timing.heartbeat_interval.is_zero() {
            anyhow::bail!("timing.heartbeat_interval_secs must be greater than 0");
        }
        if timing.heartbeat_failure_threshold == 0 {
            anyhow::bail!("timing.heartbeat_failure_threshold must be at least 1");
        }
        if timing.submit_max_attempts == 0 {
            anyhow::bail!("timing.submit_max_attempts must be at least 1");
        }
        if timing.submit_backoff_base.is_zero()
            || timing.submit_backoff_max < timing.submit_backoff_base
        {
            anyhow::bail!("timing.submit_backoff_* must be positive with max >= base");
        }

        Ok(())
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Candidate config file locations, most specific first
fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(format!("{APP_NAME}.toml"))];
    if let Some(dirs) = directories::ProjectDirs::from("", "", APP_NAME) {
        paths.push(dirs.config_dir().join("config.toml"));
    }
    paths.push(PathBuf::from("/etc").join(APP_NAME).join("config.toml"));
    paths
}

/// Returns the first candidate that exists as a file
fn find_config_file(candidates: &[PathBuf]) -> Result<PathBuf> {
    candidates
        .iter()
        .find(|path| path.is_file())
        .cloned()
        .ok_or_else(|| {
            let searched = candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            anyhow::anyhow!("no config file found, searched: {searched}")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
        [runner]
        name = "lab runner 1"

        [backend]
        url = "https://backend.example.org/"
        auth_token = "abc_DEF-123"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.runner.priority, 100);
        assert_eq!(config.backend.url, "https://backend.example.org");
        assert_eq!(config.backend.request_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.device, "cuda");
        assert_eq!(config.engine.dummy_delay, Duration::from_secs(3));
        assert_eq!(config.timing, TimingConfig::default());
        assert_eq!(config.engine.model_prefetching, ModelPrefetching::All);
        assert_eq!(config.engine.model_download_url, DEFAULT_MODEL_DOWNLOAD_URL);
        assert!(config.engine.vad_model.is_none());
        assert_eq!(config.runner.source_code_url, env!("CARGO_PKG_REPOSITORY"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let raw = r#"
            [runner]
            name = "gpu box"
            priority = 250
            source_code_url = "https://git.example.org/wren/runner"

            [backend]
            url = "http://localhost:5000"
            auth_token = "tok"
            request_timeout_secs = 5

            [engine]
            model_cache_dir = "/var/cache/wren"
            device = "cpu"
            command = "/opt/whisper/bin/whisper-cli"
            work_dir = "/srv/wren/jobs"
            dummy_delay_secs = 1
            model_prefetching = "none"
            model_download_url = "https://mirror.example.org/ggml/"
            vad_model = "/var/cache/wren/ggml-silero-v5.1.2.bin"

            [timing]
            poll_interval_secs = 2
            max_poll_backoff_secs = 60
            heartbeat_interval_secs = 5
            heartbeat_failure_threshold = 3
            submit_max_attempts = 8
            submit_backoff_base_secs = 1
            submit_backoff_max_secs = 30
        "#;
        let config = Config::from_toml_str(raw).unwrap();

        assert_eq!(config.runner.priority, 250);
        assert_eq!(config.engine.model_cache_dir, PathBuf::from("/var/cache/wren"));
        assert_eq!(config.engine.command, "/opt/whisper/bin/whisper-cli");
        assert_eq!(config.timing.poll_interval, Duration::from_secs(2));
        assert_eq!(config.timing.heartbeat_failure_threshold, 3);
        assert_eq!(config.timing.submit_max_attempts, 8);
        assert_eq!(config.engine.model_prefetching, ModelPrefetching::None);
        assert_eq!(config.engine.model_download_url, "https://mirror.example.org/ggml");
        assert_eq!(
            config.engine.vad_model,
            Some(PathBuf::from("/var/cache/wren/ggml-silero-v5.1.2.bin"))
        );
        assert_eq!(config.runner.source_code_url, "https://git.example.org/wren/runner");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_option_rejected() {
        let raw = format!("{MINIMAL}\n[timing]\npoll_intervall_secs = 3\n");
        assert!(Config::from_toml_str(&raw).is_err());
    }

    #[test]
    fn test_token_from_environment() {
        let raw = r#"
            [runner]
            name = "r"

            [backend]
            url = "https://backend.example.org"
        "#;
        let mut config = Config::from_toml_str(raw).unwrap();
        assert!(config.validate().is_err());

        let env: HashMap<&str, &str> = [
            (TOKEN_ENV, "from-env"),
            ("WREN_DEVICE", "cpu"),
            ("WREN_BACKEND_URL", "http://other:8080/"),
        ]
        .into();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.backend.auth_token.expose(), "from-env");
        assert_eq!(config.engine.device, "cpu");
        assert_eq!(config.backend.url, "http://other:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        assert!(config.validate().is_ok());

        config.runner.name = "x".repeat(41);
        assert!(config.validate().is_err());
        config.runner.name = "ok".to_string();

        config.backend.url = "ftp://backend".to_string();
        assert!(config.validate().is_err());
        config.backend.url = "https://backend".to_string();

        config.backend.auth_token = AuthToken::new("has space");
        assert!(config.validate().is_err());
        config.backend.auth_token = AuthToken::new("ok");

        config.timing.max_poll_backoff = Duration::from_secs(1);
        assert!(config.validate().is_err());
        config.timing.max_poll_backoff = Duration::from_secs(300);

        config.timing.submit_max_attempts = 0;
        assert!(config.validate().is_err());
        config.timing.submit_max_attempts = 1;

        config.engine.model_download_url = "file:///models".to_string();
        assert!(config.validate().is_err());
        config.engine.model_download_url = DEFAULT_MODEL_DOWNLOAD_URL.to_string();

        config.runner.source_code_url = "git@example.org:wren.git".to_string();
        assert!(config.validate().is_err());
        config.runner.source_code_url = String::new();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_token_redacted_in_debug() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("abc_DEF-123"));
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.runner.name, "lab runner 1");

        let missing = dir.path().join("missing.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_find_config_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.toml");
        let second = dir.path().join("b.toml");
        std::fs::write(&second, MINIMAL).unwrap();

        let found = find_config_file(&[first.clone(), second.clone()]).unwrap();
        assert_eq!(found, second);

        std::fs::write(&first, MINIMAL).unwrap();
        let found = find_config_file(&[first.clone(), second]).unwrap();
        assert_eq!(found, first);

        assert!(find_config_file(&[dir.path().join("none.toml")]).is_err());
    }
}
