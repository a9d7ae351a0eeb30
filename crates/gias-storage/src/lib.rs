//! Key-addressed blob storage + HTTP fetch utilities for the GIAS ingest.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
pub use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gias-storage";

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub key: String,
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Named-path byte store. Keys are relative, `/`-separated paths.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob>;
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    /// Absolute filesystem path of a key, as handed to the database's bulk loader.
    fn absolute_path(&self, key: &str) -> anyhow::Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn key_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid blob key {key:?}");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    /// Replace the blob at `key` via temp-file write + atomic rename.
    async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        let path = self.key_path(key)?;
        let parent = path
            .parent()
            .with_context(|| format!("blob key {key:?} has no parent directory"))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating blob directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp blob file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp blob file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp blob file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp blob {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredBlob {
            key: key.to_string(),
            content_hash: Self::sha256_hex(bytes),
            absolute_path: self.absolute_path(key)?,
            byte_size: bytes.len(),
        })
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.key_path(key)?;
        fs::read(&path)
            .await
            .with_context(|| format!("reading blob {}", path.display()))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("deleting blob {}", path.display())),
        }
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.key_path(key)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking blob path {}", path.display()))
    }

    fn absolute_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let path = self.key_path(key)?;
        std::path::absolute(&path)
            .with_context(|| format!("resolving absolute path for {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 4xx is permanent; 5xx may clear up on a later attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }
}

impl BackoffPolicy {
    /// Same delay before every retry.
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("client error: http {status} for {url}")]
    ClientError { status: u16, url: String },
    #[error("server error: http {status} for {url} after {attempts} attempts")]
    ServerError {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("timed out fetching {url} after {attempts} attempts")]
    Timeout { url: String, attempts: usize },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl FetchError {
    pub fn classification(&self) -> &'static str {
        match self {
            FetchError::ClientError { .. } => "ClientError",
            FetchError::ServerError { .. } => "ServerError",
            FetchError::Timeout { .. } => "Timeout",
            FetchError::Transport(_) => "TransportError",
        }
    }
}

/// Source of the daily export bytes.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let max_attempts = self.backoff.max_retries + 1;

        for attempt in 0..max_attempts {
            let attempts = attempt + 1;
            let retry_left = attempts < max_attempts;

            let failure = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body: body.to_vec(),
                                    attempts,
                                })
                            }
                            Err(err) => err,
                        }
                    } else {
                        if classify_status(status) == RetryDisposition::NonRetryable {
                            return Err(FetchError::ClientError {
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                        if !retry_left {
                            return Err(FetchError::ServerError {
                                status: status.as_u16(),
                                url: final_url,
                                attempts,
                            });
                        }
                        warn!(status = status.as_u16(), attempts, "server error, retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                }
                Err(err) => err,
            };

            if classify_reqwest_error(&failure) == RetryDisposition::Retryable && retry_left {
                warn!(error = %failure, attempts, "request failed, retrying");
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                continue;
            }
            if failure.is_timeout() {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                    attempts,
                });
            }
            return Err(FetchError::Transport(failure));
        }

        unreachable!("retry loop returns on its final attempt")
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }
}
