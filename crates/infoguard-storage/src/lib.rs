//! Persistence, raw revision archive and HTTP fetch utilities for InfoGuard.

mod store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub use store::{RiskRow, Store, StoreError};

pub const CRATE_NAME: &str = "infoguard-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Filesystem-safe form of a document title.
pub fn document_slug(document_id: &str) -> String {
    let slug = document_id
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedRevision {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError {
    let path = path.to_path_buf();
    move |source| ArchiveError::Io {
        action,
        path,
        source,
    }
}

/// Immutable archive of raw revision markup, addressed by document, revision id and content hash.
#[derive(Debug, Clone)]
pub struct RevisionArchive {
    root: PathBuf,
}

impl RevisionArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn relative_path(&self, document_id: &str, revision_id: i64, content_hash: &str) -> PathBuf {
        PathBuf::from(document_slug(document_id)).join(format!("{revision_id}.{content_hash}.wiki"))
    }

    /// Write through a temp file and rename; an existing target counts as deduplicated.
    pub async fn store(
        &self,
        document_id: &str,
        revision_id: i64,
        raw_content: &str,
    ) -> Result<ArchivedRevision, ArchiveError> {
        let bytes = raw_content.as_bytes();
        let content_hash = sha256_hex(bytes);
        let relative_path = self.relative_path(document_id, revision_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let archived = |deduplicated| ArchivedRevision {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        fs::create_dir_all(&parent)
            .await
            .map_err(io_err("creating archive directory", &parent))?;

        if fs::try_exists(&absolute_path)
            .await
            .map_err(io_err("checking archive path", &absolute_path))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err("opening temp archive file", &temp_path))?;
        file.write_all(bytes)
            .await
            .map_err(io_err("writing temp archive file", &temp_path))?;
        file.flush()
            .await
            .map_err(io_err("flushing temp archive file", &temp_path))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_err("renaming temp archive file into", &absolute_path)(err))
            }
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
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: `base_delay · 2^attempt`, capped. `max_retries` excludes the first try.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn total_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between consecutive requests.
    pub min_request_interval: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            min_request_interval: None,
        }
    }
}

/// Serializes request starts so they are at least `min_interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(at) = *next_slot {
            tokio::time::sleep_until(at).await;
        }
        *next_slot = Some(Instant::now() + self.min_interval);
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// HTTP access to the corpus API and collaborator services, with retry and pacing.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            pacer: config.min_request_interval.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }

    /// Send a request built fresh for every attempt, retrying transport errors and 429/5xx.
    /// Returns the body of the first successful response.
    pub async fn execute<F>(&self, url: &str, build: F) -> Result<Vec<u8>, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("http_fetch", url);
        async {
            let attempts = self.backoff.total_attempts();
            for attempt in 0..attempts {
                let is_last = attempt + 1 == attempts;
                if let Some(pacer) = &self.pacer {
                    pacer.wait_turn().await;
                }

                let err = match build(&self.client).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            match resp.bytes().await {
                                Ok(body) => return Ok(body.to_vec()),
                                Err(err) => err,
                            }
                        } else {
                            if classify_status(status) == RetryDisposition::Retryable && !is_last {
                                warn!(attempt = attempt + 1, attempts, status = status.as_u16(), "retryable status, backing off");
                                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                                continue;
                            }
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: resp.url().to_string(),
                            });
                        }
                    }
                    Err(err) => err,
                };

                if classify_reqwest_error(&err) == RetryDisposition::Retryable && !is_last {
                    warn!(attempt = attempt + 1, attempts, error = %err, "request error, backing off");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    continue;
                }
                return Err(FetchError::Request(err));
            }
            unreachable!("the final attempt always returns")
        }
        .instrument(span)
        .await
    }

    pub async fn get_json(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<serde_json::Value, FetchError> {
        let body = self.execute(url, |client| client.get(url).query(params)).await?;
        decode_json(url, &body)
    }

    /// The corpus-facing fetch: `None` after retries are exhausted, never an error.
    pub async fn get_json_or_skip(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Option<serde_json::Value> {
        match self.get_json(url, params).await {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(url, error = %err, "fetch failed after retries; skipping");
                None
            }
        }
    }

    pub async fn post_json<B>(&self, url: &str, body: &B) -> Result<serde_json::Value, FetchError>
    where
        B: Serialize + ?Sized,
    {
        let raw = self.execute(url, |client| client.post(url).json(body)).await?;
        decode_json(url, &raw)
    }
}

fn decode_json(url: &str, body: &[u8]) -> Result<serde_json::Value, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves `script[i]` to the i-th connection, repeating the last entry once exhausted.
    async fn scripted_server(script: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}/w/api.php", listener.local_addr().expect("addr"));
        let hits = Arc::new(AtomicUsize::new(0));
        let served = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = served.fetch_add(1, Ordering::SeqCst);
                let (code, body) = script[n.min(script.len() - 1)];
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => request.extend_from_slice(&buf[..read]),
                    }
                }
                let reason = StatusCode::from_u16(code)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("");
                let response = format!(
                    "HTTP/1.1 {code} {reason}\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (url, hits)
    }

    fn quick_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .expect("client")
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn slugs_are_filesystem_safe() {
        assert_eq!(document_slug("Donald Trump"), "donald-trump");
        assert_eq!(document_slug("C++ (programming language)"), "c-programming-language");
        assert_eq!(document_slug("///"), "untitled");
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_revisions() {
        let dir = tempdir().expect("tempdir");
        let archive = RevisionArchive::new(dir.path());

        let first = archive
            .store("Climate change", 1201, "'''Climate change''' is ...")
            .await
            .expect("first store");
        let second = archive
            .store("Climate change", 1201, "'''Climate change''' is ...")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first
            .relative_path
            .starts_with(PathBuf::from("climate-change")));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn default_backoff_doubles_from_one_second() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.total_attempts(), 5);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(16));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn pacer_spaces_requests() {
        let pacer = RequestPacer::new(Duration::from_millis(40));
        let start = Instant::now();
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn throttling_and_server_errors_are_retried_until_success() {
        let (url, hits) = scripted_server(vec![
            (503, "{}"),
            (429, "{}"),
            (200, r#"{"query":{"pages":[]}}"#),
        ])
        .await;
        let value = quick_fetcher().get_json(&url, &[("action", "query")]).await.expect("json");
        assert_eq!(value["query"]["pages"], serde_json::json!([]));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retrying() {
        let (url, hits) = scripted_server(vec![(404, "{}")]).await;
        let err = quick_fetcher().get_json(&url, &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_skip_instead_of_failing() {
        let (url, hits) = scripted_server(vec![(500, "{}")]).await;
        assert!(quick_fetcher().get_json_or_skip(&url, &[]).await.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let (url, _) = scripted_server(vec![(200, "<html>maintenance</html>")]).await;
        let err = quick_fetcher().get_json(&url, &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }
}
