//! HTTP fetch capability, host capability traits, and the local site store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;
use vidpub_core::{EntryId, LogEntry, MediaId, NewEntry, PostStatus, Taxonomy, TermId};

mod site;

pub use site::{MediaRecord, MediaSideloader, SiteStore};

pub const CRATE_NAME: &str = "vidpub-storage";

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed on-disk store for sideloaded thumbnail images.
#[derive(Debug, Clone)]
pub struct MediaLibrary {
    root: PathBuf,
}

impl MediaLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn media_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        entry: EntryId,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let month = fetched_at.format("%Y/%m").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(month)
            .join(entry.to_string())
            .join(format!("{content_hash}.{ext}"))
    }

    /// Files a thumbnail under its content hash. Identical bytes for the same entry and
    /// month resolve to the existing file.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        entry: EntryId,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredMedia> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.media_relative_path(fetched_at, entry, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let stored = |deduplicated: bool| StoredMedia {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("media path {} has no parent", absolute_path.display()))?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating media directory {}", dir.display()))?;
        if fs::try_exists(&absolute_path).await.unwrap_or(false) {
            return Ok(stored(true));
        }

        let temp_path = dir.join(format!(".thumb.{}.tmp", Uuid::new_v4()));
        write_temp_file(&temp_path, bytes).await?;
        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    return Ok(stored(true));
                }
                Err(err).with_context(|| format!("moving thumbnail into {}", absolute_path.display()))
            }
        }
    }
}

pub(crate) async fn write_temp_file(temp_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    Ok(())
}

/// File extension for a sideloaded image, preferring the declared content type.
pub fn image_extension(url: &str, content_type: Option<&str>) -> String {
    let by_type = content_type
        .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
        .and_then(|ct| match ct.as_str() {
            "image/jpeg" | "image/jpg" => Some("jpg"),
            "image/png" => Some("png"),
            "image/webp" => Some("webp"),
            "image/gif" => Some("gif"),
            "image/avif" => Some("avif"),
            _ => None,
        });
    if let Some(ext) = by_type {
        return ext.to_string();
    }

    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    match last.rsplit_once('.') {
        Some((_, ext))
            if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "bin".to_string(),
    }
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

/// Retry policy for transient failures. The default performs no retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
            timeout: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("{0}")]
    Transport(String),
}

/// Generic outbound HTTP capability consumed by the API client and the media sideloader.
/// Non-2xx responses surface as [`FetchError::HttpStatus`].
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<FetchedResponse, FetchError>;
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

    fn build(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    async fn execute_with_retries(
        &self,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let outcome = self.send_once(request).await;
            let disposition = match &outcome {
                Err(FetchError::HttpStatus { status, .. }) => StatusCode::from_u16(*status)
                    .map(classify_status)
                    .unwrap_or(RetryDisposition::NonRetryable),
                Err(FetchError::Request(err)) => classify_reqwest_error(err),
                _ => RetryDisposition::NonRetryable,
            };
            if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                let delay = self.backoff.delay_for_attempt(attempt);
                debug!(attempt, ?delay, url = %request.url, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return outcome;
        }
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let resp = self.build(request).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body,
            });
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status: status.as_u16(),
            final_url,
            content_type,
            body,
        })
    }
}

#[async_trait]
impl HttpFetch for HttpFetcher {
    async fn execute(&self, request: HttpRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = ?request.method, url = %request.url);
        self.execute_with_retries(&request).instrument(span).await
    }
}

/// Host content repository: entries keyed by external id, taxonomy terms, metadata, media.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Looks across every lifecycle state, not only published entries.
    async fn find_by_external_id(&self, external_id: &str) -> anyhow::Result<Option<EntryId>>;
    async fn create_entry(&self, entry: NewEntry) -> anyhow::Result<EntryId>;
    async fn update_entry(&self, id: EntryId, title: &str, content: &str) -> anyhow::Result<()>;
    async fn get_meta(&self, id: EntryId, key: &str) -> anyhow::Result<Option<String>>;
    async fn set_meta(&self, id: EntryId, key: &str, value: &str) -> anyhow::Result<()>;
    /// Matches a term by exact name or exact slug.
    async fn find_term(&self, taxonomy: Taxonomy, label: &str) -> anyhow::Result<Option<TermId>>;
    async fn insert_term(
        &self,
        taxonomy: Taxonomy,
        name: &str,
        slug: Option<&str>,
        parent: Option<TermId>,
    ) -> anyhow::Result<TermId>;
    /// Replaces the entry's terms in `taxonomy`.
    async fn set_entry_terms(
        &self,
        id: EntryId,
        taxonomy: Taxonomy,
        terms: &[TermId],
    ) -> anyhow::Result<()>;
    async fn attach_thumbnail_from_url(&self, id: EntryId, url: &str) -> anyhow::Result<MediaId>;
    async fn count_by_status(&self) -> anyhow::Result<BTreeMap<PostStatus, usize>>;
}

/// Named options plus expiring transients.
#[async_trait]
pub trait OptionStore: Send + Sync {
    async fn get_option(&self, key: &str) -> anyhow::Result<Option<JsonValue>>;
    async fn set_option(&self, key: &str, value: JsonValue) -> anyhow::Result<()>;
    async fn delete_option(&self, key: &str) -> anyhow::Result<()>;
    async fn get_transient(&self, key: &str) -> anyhow::Result<Option<JsonValue>>;
    async fn set_transient(&self, key: &str, value: JsonValue, ttl: Duration) -> anyhow::Result<()>;
    async fn delete_transients_with_prefix(&self, prefix: &str) -> anyhow::Result<usize>;
}

/// Activity log storage, newest entry first.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Prepends `entry` and drops the oldest entries beyond `max_entries`.
    async fn push_log(&self, entry: LogEntry, max_entries: usize) -> anyhow::Result<()>;
    async fn logs(&self) -> anyhow::Result<Vec<LogEntry>>;
    async fn clear_logs(&self) -> anyhow::Result<()>;
    /// Keeps only entries at or after `cutoff`; returns how many were dropped.
    async fn retain_logs_since(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize>;
}
