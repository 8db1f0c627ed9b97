//! whisper.cpp model cache
//!
//! Models live as `ggml-<name>.bin` files in the configured cache directory.
//! At startup the runner either downloads the missing ones or only reports
//! them, depending on [`ModelPrefetching`].

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use wren_core::domain::options::ModelVariant;

use crate::config::{EngineConfig, ModelPrefetching};

/// The set of model files kept in the cache directory
#[derive(Debug, Clone)]
pub struct ModelStore {
    cache_dir: PathBuf,
    download_url: String,
}

impl ModelStore {
    /// Creates a model store
    ///
    /// # Arguments
    /// * `cache_dir` - Directory holding the model files
    /// * `download_url` - Base URL the files are fetched from by name
    pub fn new(cache_dir: impl Into<PathBuf>, download_url: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            download_url: download_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(engine: &EngineConfig) -> Self {
        Self::new(&engine.model_cache_dir, &engine.model_download_url)
    }

    pub fn file_name(model: ModelVariant) -> String {
        let stem = match model {
            ModelVariant::Large => "large-v3",
            ModelVariant::Turbo => "large-v3-turbo",
            other => other.as_str(),
        };
        format!("ggml-{stem}.bin")
    }

    /// Location of a model's weights inside the cache
    pub fn path(&self, model: ModelVariant) -> PathBuf {
        self.cache_dir.join(Self::file_name(model))
    }

    /// Models without a file in the cache
    pub fn missing(&self) -> Vec<ModelVariant> {
        ModelVariant::ALL
            .into_iter()
            .filter(|model| !self.path(*model).is_file())
            .collect()
    }

    /// Brings the cache in line with the prefetching policy
    ///
    /// Must finish before the runner registers, so that no job waits on a
    /// download.
    pub async fn prepare(&self, policy: ModelPrefetching, client: &reqwest::Client) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| {
                format!("Failed to create model cache dir {}", self.cache_dir.display())
            })?;

        let missing = self.missing();
        if missing.is_empty() {
            info!("All models present in {}", self.cache_dir.display());
            return Ok(());
        }

        match policy {
            ModelPrefetching::None => {
                let names: Vec<&str> = missing.iter().map(ModelVariant::as_str).collect();
                warn!(
                    "Models missing from {}: {}. Jobs requesting them will fail",
                    self.cache_dir.display(),
                    names.join(", ")
                );
                Ok(())
            }
            ModelPrefetching::All => {
                info!("Prefetching {} model(s), this may take a while", missing.len());
                for model in missing {
                    self.download(model, client).await?;
                }
                info!("All models fetched successfully");
                Ok(())
            }
        }
    }

    /// Downloads one model next to its final path, then moves it in place
    async fn download(&self, model: ModelVariant, client: &reqwest::Client) -> Result<()> {
        let name = Self::file_name(model);
        let url = format!("{}/{}", self.download_url, name);
        let target = self.path(model);
        let partial = self.cache_dir.join(format!("{name}.part"));

        info!("Downloading model {} from {}", model, url);
        let mut response = client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to download model {model} from {url}"))?;

        let mut file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("Failed to create {}", partial.display()))?;

        let mut written: u64 = 0;
        let copied: Result<()> = async {
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = copied {
            if let Err(rm) = tokio::fs::remove_file(&partial).await {
                warn!("Failed to remove {}: {}", partial.display(), rm);
            }
            return Err(e.context(format!("Failed to download model {model} from {url}")));
        }

        tokio::fs::rename(&partial, &target)
            .await
            .with_context(|| format!("Failed to move model into {}", target.display()))?;

        info!("Model {} stored at {} ({} bytes)", model, target.display(), written);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answers a single request, returning its request line
    async fn serve_once(status: u16, body: &'static [u8]) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let head = format!(
                "HTTP/1.1 {status} Canned\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();

            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            request.lines().next().unwrap_or_default().to_string()
        });

        (base_url, handle)
    }

    /// Fills the cache with every model except `absent`
    fn populate_except(dir: &Path, absent: ModelVariant) {
        for model in ModelVariant::ALL {
            if model != absent {
                std::fs::write(dir.join(ModelStore::file_name(model)), b"ggml").unwrap();
            }
        }
    }

    #[test]
    fn test_file_names() {
        assert_eq!(ModelStore::file_name(ModelVariant::Large), "ggml-large-v3.bin");
        assert_eq!(ModelStore::file_name(ModelVariant::Turbo), "ggml-large-v3-turbo.bin");
        assert_eq!(ModelStore::file_name(ModelVariant::TinyEn), "ggml-tiny.en.bin");

        let store = ModelStore::new("/models", "https://example.org/ggml/");
        assert_eq!(
            store.path(ModelVariant::Base),
            PathBuf::from("/models/ggml-base.bin")
        );
    }

    #[test]
    fn test_missing_models() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), "http://127.0.0.1:9");
        assert_eq!(store.missing().len(), ModelVariant::ALL.len());

        populate_except(dir.path(), ModelVariant::Medium);
        assert_eq!(store.missing(), [ModelVariant::Medium]);
    }

    #[tokio::test]
    async fn test_prefetch_downloads_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        populate_except(dir.path(), ModelVariant::BaseEn);
        let (base_url, server) = serve_once(200, b"ggml weights").await;
        let store = ModelStore::new(dir.path(), base_url);

        store
            .prepare(ModelPrefetching::All, &reqwest::Client::new())
            .await
            .unwrap();

        assert_eq!(server.await.unwrap(), "GET /ggml-base.en.bin HTTP/1.1");
        let stored = std::fs::read(store.path(ModelVariant::BaseEn)).unwrap();
        assert_eq!(stored, b"ggml weights");
        assert!(store.missing().is_empty());
        assert!(!dir.path().join("ggml-base.en.bin.part").exists());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        populate_except(dir.path(), ModelVariant::Small);
        let (base_url, _server) = serve_once(404, b"not found").await;
        let store = ModelStore::new(dir.path(), base_url);

        let err = store
            .prepare(ModelPrefetching::All, &reqwest::Client::new())
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("small"));
        assert_eq!(store.missing(), [ModelVariant::Small]);
        assert!(!dir.path().join("ggml-small.bin.part").exists());
    }

    #[tokio::test]
    async fn test_report_only_policy_downloads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("cache"), "http://127.0.0.1:9");

        store
            .prepare(ModelPrefetching::None, &reqwest::Client::new())
            .await
            .unwrap();

        assert!(dir.path().join("cache").is_dir());
        assert_eq!(store.missing().len(), ModelVariant::ALL.len());
    }
}
