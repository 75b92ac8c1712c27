//! Retry policy, JSON-over-HTTP transport, diagnostics sink and snapshot
//! storage for the job digest pipeline.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobdigest-storage";

pub const DEFAULT_USER_AGENT: &str = "jobdigest/0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status.as_u16() {
        429 | 500 | 502 | 503 | 504 => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded attempts with exponential backoff between them.
///
/// `max_attempts` counts the first call; a value of zero still runs once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Last error of a retry loop together with the attempts spent on it.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub error: E,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Sleep applied after the given failed attempt (1-based).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, is_retryable: P) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= max_attempts || !is_retryable(&error) {
                        return Err(RetryFailure {
                            attempts: attempt,
                            error,
                        });
                    }
                    let delay = self.delay_after_attempt(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "attempt failed; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed on attempt {attempts}: {source}")]
    Request {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} on attempt {attempts}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: u32,
        body: String,
    },
    #[error("invalid JSON body from {url} on attempt {attempts}: {source}")]
    Decode {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

impl TransportError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Request { attempts, .. }
            | Self::HttpStatus { attempts, .. }
            | Self::Decode { attempts, .. } => *attempts,
        }
    }
}

/// A single logical JSON GET. Implementations own their retry behaviour.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn get_json(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            retry: RetryPolicy::default(),
        }
    }
}

/// reqwest-backed transport; one client (and its connection pool) per instance.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpTransport {
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
            retry: config.retry,
        })
    }

    async fn attempt_get(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
        attempt: u32,
    ) -> Result<JsonValue, TransportError> {
        let resp = self
            .client
            .get(endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: endpoint.to_string(),
                attempts: attempt,
                source,
            })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            warn!(attempt, status = status.as_u16(), url = %final_url, "non-success status");
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                attempts: attempt,
                body,
            });
        }

        resp.json::<JsonValue>()
            .await
            .map_err(|source| TransportError::Decode {
                url: final_url,
                attempts: attempt,
                source,
            })
    }
}

#[async_trait]
impl JsonTransport for HttpTransport {
    async fn get_json(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, TransportError> {
        let span = info_span!("http_get_json", endpoint);
        self.retry
            .run(
                |attempt| self.attempt_get(endpoint, query, attempt),
                |err: &TransportError| err.disposition() == RetryDisposition::Retryable,
            )
            .instrument(span)
            .await
            .map_err(|failure| failure.error)
    }
}

/// Record of one failed inference attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptDiagnostic {
    pub batch_index: usize,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub prompt_preview: String,
    pub response_str: Option<String>,
}

#[derive(Serialize)]
struct DiagnosticBody<'a> {
    error: &'a str,
    attempt: u32,
    prompt_preview: &'a str,
    response_str: Option<&'a str>,
}

impl AttemptDiagnostic {
    pub fn file_name(&self) -> String {
        format!(
            "raw_batch{}_attempt{}_{}.json",
            self.batch_index,
            self.attempt,
            self.timestamp.timestamp()
        )
    }

    fn body(&self) -> DiagnosticBody<'_> {
        DiagnosticBody {
            error: &self.error,
            attempt: self.attempt,
            prompt_preview: &self.prompt_preview,
            response_str: self.response_str.as_deref(),
        }
    }
}

/// Destination for failed-attempt artifacts. Returns where it was stored.
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn record(&self, diagnostic: &AttemptDiagnostic) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct FsDiagnosticsSink {
    root: PathBuf,
}

impl FsDiagnosticsSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DiagnosticsSink for FsDiagnosticsSink {
    async fn record(&self, diagnostic: &AttemptDiagnostic) -> anyhow::Result<String> {
        let path = self.root.join(diagnostic.file_name());
        let bytes = serde_json::to_vec_pretty(&diagnostic.body())
            .context("serializing attempt diagnostic")?;
        replace_atomically(&path, &bytes).await?;
        Ok(path.display().to_string())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDiagnosticsSink {
    records: Mutex<Vec<AttemptDiagnostic>>,
}

impl MemoryDiagnosticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AttemptDiagnostic> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl DiagnosticsSink for MemoryDiagnosticsSink {
    async fn record(&self, diagnostic: &AttemptDiagnostic) -> anyhow::Result<String> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.push(diagnostic.clone());
        Ok(format!("memory:{}", diagnostic.file_name()))
    }
}

/// Named snapshot files under one directory, each write fully replacing the
/// previous content.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> anyhow::Result<PathBuf> {
        let bytes =
            serde_json::to_vec_pretty(value).with_context(|| format!("serializing {name}"))?;
        self.write_bytes(name, &bytes).await
    }

    pub async fn write_bytes(&self, name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.path_for(name);
        replace_atomically(&path, bytes).await?;
        Ok(path)
    }
}

/// Write through a uniquely named temp file, then rename over `path`.
pub async fn replace_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

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

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[derive(Clone)]
    struct Flaky {
        hits: Arc<AtomicUsize>,
        fail_first: usize,
        failure: u16,
        garbled_success: bool,
    }

    async fn flaky_handler(
        State(state): State<Flaky>,
        Query(params): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        let hit = state.hits.fetch_add(1, Ordering::SeqCst);
        if hit < state.fail_first {
            let status = AxumStatus::from_u16(state.failure).expect("status");
            return (status, "upstream unavailable").into_response();
        }
        if state.garbled_success {
            return (AxumStatus::OK, "<html>maintenance</html>").into_response();
        }
        Json(serde_json::json!({ "echo": params })).into_response()
    }

    async fn spawn_flaky(fail_first: usize, failure: u16) -> (String, Arc<AtomicUsize>) {
        spawn_service(fail_first, failure, false).await
    }

    async fn spawn_service(
        fail_first: usize,
        failure: u16,
        garbled_success: bool,
    ) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let state = Flaky {
            hits: hits.clone(),
            fail_first,
            failure,
            garbled_success,
        };
        let app = Router::new()
            .route("/offers", get(flaky_handler))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{addr}/offers"), hits)
    }

    fn transport(max_attempts: u32) -> HttpTransport {
        HttpTransport::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            retry: fast_policy(max_attempts),
            ..Default::default()
        })
        .expect("transport")
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn only_listed_statuses_are_retryable() {
        for code in [429u16, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).expect("status");
            assert_eq!(classify_status(status), RetryDisposition::Retryable);
        }
        for code in [400u16, 401, 404, 501, 505] {
            let status = StatusCode::from_u16(code).expect("status");
            assert_eq!(classify_status(status), RetryDisposition::NonRetryable);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_sleeps_double_between_attempts() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        let mut seen = Vec::new();
        let started = tokio::time::Instant::now();

        let result: Result<(), RetryFailure<&str>> = policy
            .run(
                |attempt| {
                    seen.push((attempt, started.elapsed()));
                    async { Err("boom") }
                },
                |_| true,
            )
            .await;

        let failure = result.expect_err("always fails");
        assert_eq!(failure.attempts, 4);
        let attempts: Vec<u32> = seen.iter().map(|(a, _)| *a).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);
        let offsets: Vec<u128> = seen.iter().map(|(_, t)| t.as_millis()).collect();
        assert_eq!(offsets, vec![0, 100, 300, 700]);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        let mut calls = 0;
        let result: Result<(), RetryFailure<&str>> = policy
            .run(
                |_| {
                    calls += 1;
                    async { Err("fatal") }
                },
                |_| false,
            )
            .await;
        assert_eq!(result.expect_err("fails").attempts, 1);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn persistent_503_spends_every_attempt() {
        let (url, hits) = spawn_flaky(usize::MAX, 503).await;
        let err = transport(3)
            .get_json(&url, &[("days", "7".to_string())])
            .await
            .expect_err("always 503");

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        match err {
            TransportError::HttpStatus {
                status, attempts, ..
            } => {
                assert_eq!(status, 503);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, hits) = spawn_flaky(usize::MAX, 404).await;
        let err = transport(3).get_json(&url, &[]).await.expect_err("404");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failure_and_sends_query() {
        let (url, hits) = spawn_flaky(2, 429).await;
        let body = transport(3)
            .get_json(&url, &[("days", "7".to_string()), ("page", "2".to_string())])
            .await
            .expect("third attempt succeeds");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(body["echo"]["days"], "7");
        assert_eq!(body["echo"]["page"], "2");
    }

    #[tokio::test]
    async fn refused_connection_spends_every_attempt() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = transport(3)
            .get_json(&format!("http://{addr}/offers"), &[])
            .await
            .expect_err("nothing listening");

        match &err {
            TransportError::Request { source, attempts, .. } => {
                assert!(source.is_connect(), "{source:?}");
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
    }

    #[tokio::test]
    async fn stalled_service_times_out_on_every_attempt() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        let transport = HttpTransport::new(HttpClientConfig {
            timeout: Duration::from_millis(100),
            retry: fast_policy(3),
            ..Default::default()
        })
        .expect("transport");
        let err = transport
            .get_json(&format!("http://{addr}/offers"), &[])
            .await
            .expect_err("no answer");

        match &err {
            TransportError::Request { source, attempts, .. } => {
                assert!(source.is_timeout(), "{source:?}");
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(accepted.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn decode_failure_reports_the_attempt_it_happened_on() {
        let (url, hits) = spawn_service(2, 503, true).await;
        let err = transport(3).get_json(&url, &[]).await.expect_err("garbled body");

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(matches!(err, TransportError::Decode { attempts: 3, .. }), "{err:?}");
        assert_eq!(err.attempts(), 3);
        assert!(err.to_string().contains("attempt 3"));
    }

    #[tokio::test]
    async fn fs_sink_writes_named_artifact() {
        let dir = tempdir().expect("tempdir");
        let sink = FsDiagnosticsSink::new(dir.path());
        let diagnostic = AttemptDiagnostic {
            batch_index: 2,
            attempt: 1,
            timestamp: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            error: "Parse(\"expected value\")".into(),
            prompt_preview: "Perfil: ñandú".into(),
            response_str: None,
        };

        let location = sink.record(&diagnostic).await.expect("record");
        assert!(location.ends_with("raw_batch2_attempt1_1771934400.json"));

        let text = std::fs::read_to_string(&location).expect("read");
        let value: JsonValue = serde_json::from_str(&text).expect("json");
        assert_eq!(value["attempt"], 1);
        assert_eq!(value["prompt_preview"], "Perfil: ñandú");
        assert!(value["response_str"].is_null());
        assert!(text.contains("ñandú"));
    }

    #[tokio::test]
    async fn snapshot_write_replaces_previous_content() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("data"));

        store
            .write_json("matches.json", &serde_json::json!([{"id": "1"}, {"id": "2"}]))
            .await
            .expect("first");
        let path = store
            .write_json("matches.json", &serde_json::json!([]))
            .await
            .expect("second");

        let value: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value, serde_json::json!([]));
        let leftovers = std::fs::read_dir(store.root())
            .expect("dir")
            .filter_map(|e| e.ok())
            .count();
        assert_eq!(leftovers, 1);
    }
}
