//! Local event cache + federation API client for tristat.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use tristat_core::{EventDocument, EventId};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tristat-storage";

pub const DEFAULT_API_BASE_URL: &str = "https://api.triathlon.org/v1/";

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The event was already cached; nothing was written.
    pub already_cached: bool,
}

/// Flat-file cache of raw event payloads, one JSON document per event.
///
/// Cached events are never rewritten: the cache is the source of truth once
/// populated.
#[derive(Debug, Clone)]
pub struct EventCache {
    root: PathBuf,
}

impl EventCache {
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

    pub fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    pub fn event_relative_path(event_id: EventId) -> PathBuf {
        PathBuf::from("events").join(format!("{event_id}.json"))
    }

    pub fn aux_relative_path(name: &str) -> PathBuf {
        let name = name.trim_end_matches(".json");
        PathBuf::from("events").join(format!("{name}.json"))
    }

    pub async fn contains(&self, event_id: EventId) -> anyhow::Result<bool> {
        let path = self.root.join(Self::event_relative_path(event_id));
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking cached event {}", path.display()))
    }

    /// Store an event payload once, via temp-file + atomic rename.
    pub async fn save(
        &self,
        event_id: EventId,
        document: &EventDocument,
    ) -> anyhow::Result<StoredDocument> {
        let bytes = serde_json::to_vec_pretty(document)
            .with_context(|| format!("serializing event {event_id}"))?;
        let relative_path = Self::event_relative_path(event_id);
        let absolute_path = self.root.join(&relative_path);
        let content_hash = Self::sha256_hex(&bytes);

        let written = write_atomic(&absolute_path, &bytes, false).await?;
        debug!(event_id, path = %absolute_path.display(), written, "cache save");
        Ok(StoredDocument {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            already_cached: !written,
        })
    }

    pub async fn load(&self, event_id: EventId) -> anyhow::Result<Option<EventDocument>> {
        let path = self.root.join(Self::event_relative_path(event_id));
        read_json_if_exists(&path).await
    }

    /// Ids of all cached events, ascending. Auxiliary documents are skipped.
    pub async fn list_event_ids(&self) -> anyhow::Result<Vec<EventId>> {
        let dir = self.events_dir();
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking {}", dir.display()))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<EventId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn load_all(&self) -> anyhow::Result<Vec<(EventId, EventDocument)>> {
        let mut out = Vec::new();
        for event_id in self.list_event_ids().await? {
            if let Some(doc) = self.load(event_id).await? {
                out.push((event_id, doc));
            }
        }
        Ok(out)
    }

    /// Named side documents (query cache, ignored events) living next to events.
    pub async fn load_aux<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        read_json_if_exists(&self.root.join(Self::aux_relative_path(name))).await
    }

    pub async fn save_aux<T: Serialize>(&self, name: &str, value: &T) -> anyhow::Result<()> {
        let path = self.root.join(Self::aux_relative_path(name));
        let bytes =
            serde_json::to_vec_pretty(value).with_context(|| format!("serializing {name}"))?;
        write_atomic(&path, &bytes, true).await?;
        Ok(())
    }
}

async fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Returns `false` when `overwrite` is off and the target already exists.
async fn write_atomic(path: &Path, bytes: &[u8], overwrite: bool) -> anyhow::Result<bool> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating cache directory {}", parent.display()))?;

    if !overwrite
        && fs::try_exists(path)
            .await
            .with_context(|| format!("checking cache path {}", path.display()))?
    {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(true),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
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

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig {
                capacity: 5,
                refill_every: Duration::from_millis(200),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no `data` envelope in response from {url}")]
    MissingData { url: String },
    #[error("api reported errors for {url}: {message}")]
    Api { url: String, message: String },
}

/// Client for the federation REST API. Every response is wrapped in a
/// `{"data": ...}` envelope which [`ApiClient::get_data`] strips.
#[derive(Debug)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            base_url: config.base_url,
            api_key: config.api_key,
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub fn url_for(&self, path_and_query: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path_and_query.trim_start_matches('/')
        )
    }

    pub async fn get_data(&self, path_and_query: &str) -> Result<JsonValue, FetchError> {
        let url = self.url_for(path_and_query);
        let body = self
            .fetch_bytes(&url)
            .instrument(info_span!("api_fetch", url = %url))
            .await?;
        let value: JsonValue =
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: url.clone(),
                source,
            })?;
        unwrap_data_envelope(&url, value)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(key) = &self.api_key {
                request = request.header("apikey", key);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    let final_url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
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
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::MissingData {
                url: url.to_string(),
            }),
        }
    }
}

/// Strip the `data` envelope; a `data` object holding only `errors` is an API error.
pub fn unwrap_data_envelope(url: &str, mut value: JsonValue) -> Result<JsonValue, FetchError> {
    let Some(data) = value.get_mut("data").map(JsonValue::take) else {
        return Err(FetchError::MissingData {
            url: url.to_string(),
        });
    };
    if let Some(obj) = data.as_object() {
        if obj.len() == 1 {
            if let Some(errors) = obj.get("errors") {
                return Err(FetchError::Api {
                    url: url.to_string(),
                    message: errors.to_string(),
                });
            }
        }
    }
    Ok(data)
}
