//! HTTP transport, endpoint failover and durable checkpoint files for dealsync.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dealsync_core::{Checkpoint, SyncCounters};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealsync-storage";

/// API error codes the CRM uses to signal throttling inside a response body.
pub const THROTTLE_ERROR_CODES: &[&str] = &["QUERY_LIMIT_EXCEEDED"];

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub retry_after: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("reading response body failed: {0}")]
    Body(String),
}

impl TransportError {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// One GET round trip. Implementations never interpret status codes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, params: &[(String, String)])
        -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<HttpResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|err| TransportError::from_reqwest(&err))?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|err| TransportError::Body(err.to_string()))?
            .to_vec();

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    RateLimited,
    Transient,
    Rejected,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        StatusClass::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        StatusClass::Transient
    } else {
        StatusClass::Rejected
    }
}

/// True when the body is the CRM's `{"error": "QUERY_LIMIT_EXCEEDED", ...}` envelope.
pub fn is_throttle_envelope(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .is_some_and(|code| THROTTLE_ERROR_CODES.contains(&code.as_str()))
}

/// Reads the `{"error": ..., "error_description": ...}` envelope the CRM sends with
/// rejected calls.
pub fn api_error(body: &[u8]) -> Option<EndpointError> {
    let value = serde_json::from_slice::<serde_json::Value>(body).ok()?;
    let code = value.get("error")?.as_str()?.to_string();
    let description = value
        .get("error_description")
        .and_then(|d| d.as_str())
        .unwrap_or_default()
        .to_string();
    Some(EndpointError::Api { code, description })
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    /// Wait used when `Retry-After` is absent or unparsable.
    pub default_wait: Duration,
    pub max_wait: Duration,
    /// When set, a rate-limit wait is handed back to the caller as a failed attempt
    /// instead of looping on the same endpoint.
    pub counts_toward_retry_budget: bool,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            default_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(300),
            counts_toward_retry_budget: false,
        }
    }
}

impl RateLimitPolicy {
    /// `Retry-After` is read as whole seconds.
    pub fn wait_for(&self, retry_after: Option<&str>) -> Duration {
        retry_after
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.default_wait)
            .min(self.max_wait)
    }
}

/// Method call against the CRM REST API; the endpoint is chosen by the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: String,
    pub params: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn set_param(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.params.push((key.to_string(), value)),
        }
    }

    pub fn url_for(&self, endpoint: &str) -> String {
        format!("{}/{}", endpoint.trim_end_matches('/'), self.method)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("http status {status}")]
    Status { status: u16, transient: bool },
    #[error("malformed response body: {0}")]
    Malformed(String),
    #[error("api error {code}: {description}")]
    Api { code: String, description: String },
}

impl EndpointError {
    pub fn is_not_found(&self) -> bool {
        match self {
            EndpointError::Api { code, description } => {
                code.eq_ignore_ascii_case("NOT_FOUND")
                    || description.trim().eq_ignore_ascii_case("not found")
            }
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            EndpointError::Transport(_) => true,
            EndpointError::Status { transient, .. } => *transient,
            EndpointError::Malformed(_) | EndpointError::Api { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    pub endpoint: usize,
    pub url: String,
    pub error: EndpointError,
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}: {}", self.endpoint, self.url, self.error)
    }
}

fn describe_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("all endpoints failed: {}", describe_failures(.failures))]
    Exhausted { failures: Vec<EndpointFailure> },
    #[error("endpoint #{endpoint} rate limited the request; waited {waited:?}")]
    RateLimited { endpoint: usize, waited: Duration },
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Selected<T> {
    pub endpoint: usize,
    pub value: T,
}

/// Sleeps unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Ordered failover over functionally-equivalent endpoints.
#[derive(Clone)]
pub struct EndpointSelector {
    endpoints: Arc<[String]>,
    transport: Arc<dyn Transport>,
    rate_limit: RateLimitPolicy,
    counters: Arc<SyncCounters>,
}

impl fmt::Debug for EndpointSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSelector")
            .field("endpoints", &self.endpoints)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

impl EndpointSelector {
    pub fn new(
        endpoints: Vec<String>,
        transport: Arc<dyn Transport>,
        rate_limit: RateLimitPolicy,
        counters: Arc<SyncCounters>,
    ) -> Self {
        Self {
            endpoints: endpoints.into(),
            transport,
            rate_limit,
            counters,
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn counters(&self) -> &Arc<SyncCounters> {
        &self.counters
    }

    /// Selector restricted to one endpoint, sharing transport, policy and counters.
    pub fn single(&self, index: usize) -> Option<Self> {
        let endpoint = self.endpoints.get(index)?.clone();
        Some(Self {
            endpoints: vec![endpoint].into(),
            transport: Arc::clone(&self.transport),
            rate_limit: self.rate_limit,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Tries each endpoint in order. A 429 (or throttle envelope) sleeps and retries the
    /// same endpoint; any other failure moves on to the next one. `decode` turns a 2xx
    /// body into a value; its errors count as the endpoint failing.
    pub async fn call<T, F>(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
        decode: F,
    ) -> Result<Selected<T>, SelectError>
    where
        F: Fn(&[u8]) -> Result<T, EndpointError>,
    {
        let mut failures = Vec::new();

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let url = request.url_for(endpoint);

            loop {
                let span = info_span!("crm_call", method = %request.method, endpoint = index);
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SelectError::Cancelled),
                    result = self.transport.get(&url, &request.params).instrument(span) => result,
                };

                let failure = match outcome {
                    Ok(resp) => {
                        let class = classify_status(resp.status);
                        if class == StatusClass::RateLimited || is_throttle_envelope(&resp.body) {
                            let wait = self.rate_limit.wait_for(resp.retry_after.as_deref());
                            self.counters.rate_limit_wait();
                            warn!(
                                method = %request.method,
                                endpoint = index,
                                wait_secs = wait.as_secs_f64(),
                                "rate limited; waiting before retrying the same endpoint"
                            );
                            if !sleep_or_cancel(wait, cancel).await {
                                return Err(SelectError::Cancelled);
                            }
                            if self.rate_limit.counts_toward_retry_budget {
                                return Err(SelectError::RateLimited {
                                    endpoint: index,
                                    waited: wait,
                                });
                            }
                            continue;
                        }

                        if class == StatusClass::Success {
                            match decode(&resp.body) {
                                Ok(value) => {
                                    return Ok(Selected {
                                        endpoint: index,
                                        value,
                                    })
                                }
                                Err(err) => err,
                            }
                        } else if class == StatusClass::Rejected {
                            api_error(&resp.body).unwrap_or(EndpointError::Status {
                                status: resp.status.as_u16(),
                                transient: false,
                            })
                        } else {
                            EndpointError::Status {
                                status: resp.status.as_u16(),
                                transient: true,
                            }
                        }
                    }
                    Err(err) => EndpointError::Transport(err),
                };

                self.counters.endpoint_failure();
                warn!(
                    method = %request.method,
                    endpoint = index,
                    error = %failure,
                    transient = failure.is_transient(),
                    "endpoint failed; trying next"
                );
                failures.push(EndpointFailure {
                    endpoint: index,
                    url: url.clone(),
                    error: failure,
                });
                break;
            }
        }

        warn!(method = %request.method, endpoints = self.endpoints.len(), "all endpoints failed");
        Err(SelectError::Exhausted { failures })
    }
}

/// Durable storage for per-stream checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, stream: &str) -> anyhow::Result<Option<Checkpoint>>;

    /// Persists `checkpoint`, rejecting it if it regresses the stored one of the same run.
    async fn save(&self, stream: &str, checkpoint: &Checkpoint) -> anyhow::Result<()>;

    /// Returns whether a checkpoint existed.
    async fn clear(&self, stream: &str) -> anyhow::Result<bool>;
}

/// One JSON file per stream, replaced atomically via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, stream: &str) -> PathBuf {
        let name = stream
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect::<String>();
        self.root.join(format!("{name}.checkpoint.json"))
    }

    async fn write_atomically(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating checkpoint directory {}", self.root.display()))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp checkpoint file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp checkpoint file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp checkpoint file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp checkpoint {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, stream: &str) -> anyhow::Result<Option<Checkpoint>> {
        let path = self.path_for(stream);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking checkpoint path {}", path.display()))?
        {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let checkpoint =
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, stream: &str, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        if let Some(existing) = self.load(stream).await? {
            checkpoint.ensure_follows(&existing)?;
        }
        let bytes = serde_json::to_vec_pretty(checkpoint).context("serializing checkpoint")?;
        self.write_atomically(&self.path_for(stream), &bytes).await
    }

    async fn clear(&self, stream: &str) -> anyhow::Result<bool> {
        let path = self.path_for(stream);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    //! In-memory transport that replays scripted responses.

    use std::collections::VecDeque;
    use std::sync::{Mutex, MutexGuard};

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Reply(HttpResponse),
        Fail(TransportError),
    }

    impl HttpResponse {
        pub fn json(status: u16, body: &serde_json::Value) -> Self {
            Self {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                retry_after: None,
                body: body.to_string().into_bytes(),
            }
        }

        pub fn too_many_requests(retry_after: Option<&str>) -> Self {
            Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                retry_after: retry_after.map(str::to_string),
                body: Vec::new(),
            }
        }
    }

    impl Scripted {
        pub fn ok(body: serde_json::Value) -> Self {
            Scripted::Reply(HttpResponse::json(200, &body))
        }

        pub fn status(status: u16) -> Self {
            Scripted::Reply(HttpResponse::json(status, &serde_json::json!({})))
        }

        pub fn rate_limited(retry_after: Option<&str>) -> Self {
            Scripted::Reply(HttpResponse::too_many_requests(retry_after))
        }
    }

    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        /// `url?k=v&k=v` with unescaped parameters.
        pub target: String,
        pub at: tokio::time::Instant,
    }

    #[derive(Debug)]
    struct Route {
        pattern: String,
        queue: VecDeque<Scripted>,
        fallback: Option<Scripted>,
    }

    /// Replies to requests whose `url?params` contains a registered pattern. Queued
    /// replies are consumed in order before the pattern's fallback is used; unmatched
    /// requests get a 404.
    #[derive(Debug, Default)]
    pub struct ScriptedTransport {
        routes: Mutex<Vec<Route>>,
        requests: Mutex<Vec<RecordedRequest>>,
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn enqueue(&self, pattern: &str, reply: Scripted) -> &Self {
            self.route_mut(pattern, |route| route.queue.push_back(reply));
            self
        }

        pub fn always(&self, pattern: &str, reply: Scripted) -> &Self {
            self.route_mut(pattern, |route| route.fallback = Some(reply));
            self
        }

        fn route_mut(&self, pattern: &str, apply: impl FnOnce(&mut Route)) {
            let mut routes = lock(&self.routes);
            if let Some(route) = routes.iter_mut().find(|r| r.pattern == pattern) {
                apply(route);
                return;
            }
            let mut route = Route {
                pattern: pattern.to_string(),
                queue: VecDeque::new(),
                fallback: None,
            };
            apply(&mut route);
            routes.push(route);
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            lock(&self.requests).clone()
        }

        pub fn count_matching(&self, pattern: &str) -> usize {
            lock(&self.requests)
                .iter()
                .filter(|r| r.target.contains(pattern))
                .count()
        }

        fn reply_for(&self, target: &str) -> Option<Scripted> {
            let mut routes = lock(&self.routes);
            if let Some(route) = routes
                .iter_mut()
                .find(|r| target.contains(&r.pattern) && !r.queue.is_empty())
            {
                return route.queue.pop_front();
            }
            routes
                .iter()
                .find(|r| target.contains(&r.pattern) && r.fallback.is_some())
                .and_then(|r| r.fallback.clone())
        }
    }

    /// Checkpoint store kept in memory, with the same regression check as the durable ones.
    #[derive(Debug, Default)]
    pub struct MemoryCheckpointStore {
        entries: Mutex<std::collections::HashMap<String, Checkpoint>>,
    }

    impl MemoryCheckpointStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn get(&self, stream: &str) -> Option<Checkpoint> {
            lock(&self.entries).get(stream).cloned()
        }

        pub fn put(&self, stream: &str, checkpoint: Checkpoint) {
            lock(&self.entries).insert(stream.to_string(), checkpoint);
        }
    }

    #[async_trait]
    impl CheckpointStore for MemoryCheckpointStore {
        async fn load(&self, stream: &str) -> anyhow::Result<Option<Checkpoint>> {
            Ok(self.get(stream))
        }

        async fn save(&self, stream: &str, checkpoint: &Checkpoint) -> anyhow::Result<()> {
            let mut entries = lock(&self.entries);
            if let Some(existing) = entries.get(stream) {
                checkpoint.ensure_follows(existing)?;
            }
            entries.insert(stream.to_string(), checkpoint.clone());
            Ok(())
        }

        async fn clear(&self, stream: &str) -> anyhow::Result<bool> {
            Ok(lock(&self.entries).remove(stream).is_some())
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(
            &self,
            url: &str,
            params: &[(String, String)],
        ) -> Result<HttpResponse, TransportError> {
            let query = params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            let target = format!("{url}?{query}");
            lock(&self.requests).push(RecordedRequest {
                target: target.clone(),
                at: tokio::time::Instant::now(),
            });

            match self.reply_for(&target) {
                Some(Scripted::Reply(resp)) => Ok(resp),
                Some(Scripted::Fail(err)) => Err(err),
                None => Ok(HttpResponse::json(404, &serde_json::json!({"error": "unscripted"}))),
            }
        }
    }
}
