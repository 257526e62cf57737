//! Wide-table persistence + paced HTTP fetch utilities.

pub mod codec;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use autosales_core::{Cadence, WideTable};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info_span, warn, Instrument};
use uuid::Uuid;

pub use codec::{TableError, TableFormat};

pub const CRATE_NAME: &str = "autosales-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOutcome {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub used_fallback: bool,
}

/// Reads and rewrites whole wide tables. Every write goes to a temp file
/// next to the destination and is renamed into place, so readers never see
/// a partially written table.
#[derive(Debug, Clone, Default)]
pub struct TableStore {
    fallback_dir: Option<PathBuf>,
}

impl TableStore {
    pub fn new(fallback_dir: Option<PathBuf>) -> Self {
        Self { fallback_dir }
    }

    /// Loads the table at `path`, or `None` when no table has been persisted yet.
    pub async fn load(&self, path: &Path, cadence: Cadence) -> anyhow::Result<Option<WideTable>> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking table path {}", path.display()))?
        {
            return Ok(None);
        }
        codec::read_table(path, cadence).map(Some)
    }

    /// Timestamped sibling used when the destination cannot be written.
    pub fn fallback_path(&self, path: &Path, now: DateTime<Utc>) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "table".to_string());
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "csv".to_string());
        let name = format!("{stem}_{}.{ext}", now.format("%Y%m%d_%H%M%S"));
        match &self.fallback_dir {
            Some(dir) => dir.join(name),
            None => path
                .parent()
                .map(|p| p.join(&name))
                .unwrap_or_else(|| PathBuf::from(&name)),
        }
    }

    /// Overwrites the destination with `table`. On failure, makes exactly one
    /// attempt at a timestamped fallback location before giving up.
    pub async fn persist(&self, table: &WideTable, path: &Path) -> anyhow::Result<PersistOutcome> {
        let format = TableFormat::from_path(path)?;
        let bytes = codec::encode(table, format)
            .with_context(|| format!("encoding table for {}", path.display()))?;
        let content_hash = sha256_hex(&bytes);

        match write_atomic(path, &bytes).await {
            Ok(()) => Ok(PersistOutcome {
                path: path.to_path_buf(),
                content_hash,
                byte_size: bytes.len(),
                used_fallback: false,
            }),
            Err(primary) => {
                let fallback = self.fallback_path(path, Utc::now());
                warn!(
                    destination = %path.display(),
                    fallback = %fallback.display(),
                    error = %primary,
                    "table write failed; trying fallback location"
                );
                match write_atomic(&fallback, &bytes).await {
                    Ok(()) => Ok(PersistOutcome {
                        path: fallback,
                        content_hash,
                        byte_size: bytes.len(),
                        used_fallback: true,
                    }),
                    Err(secondary) => {
                        error!(
                            destination = %path.display(),
                            fallback = %fallback.display(),
                            error = %secondary,
                            "fallback table write failed"
                        );
                        Err(secondary.context(format!(
                            "persisting table to {} (primary error: {primary:#})",
                            path.display()
                        )))
                    }
                }
            }
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating table directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp table file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp table file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp table {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
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
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
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
    pub request_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            request_delay: Duration::from_millis(1500),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Enforces a fixed minimum gap between consecutive requests.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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
            pacer: RequestPacer::new(config.request_delay),
            backoff: config.backoff,
        })
    }

    /// GETs `url` with `query`. Waits for the pacer first; retryable failures
    /// are retried up to `max_retries` times with backoff.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.pacer.wait().await;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url, query).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt = attempt + 1, "retryable status; retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt = attempt + 1, "request failed; retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
