//! Remote endpoint abstraction used to replay queued mutations.

use async_trait::async_trait;
use reqwest::{Client, Method};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;
use url::Url;

use offsync_common::{Error, Result};
use offsync_storage::{HttpMethod, QueuedMutation};

/// Default per-request time budget.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether an HTTP status counts as accepted.
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Sends one queued mutation to the remote service.
///
/// Implementations return the HTTP status for any response that arrived and
/// an error for transport failures (refused, reset, DNS, timeout). The
/// coordinator decides what counts as success.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logging (e.g., "http", "mock").
    fn name(&self) -> &str;

    /// Replay `mutation` as a single request.
    async fn execute(&self, mutation: &QueuedMutation) -> Result<u16>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    http: Client,
    base_url: Option<Url>,
}

impl HttpTransport {
    /// Create a transport.
    ///
    /// Relative endpoints are joined onto `base_url`; absolute endpoints are
    /// used as given.
    pub fn new(base_url: Option<Url>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("offsync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base_url })
    }

    /// Resolve a queued endpoint to a full URL.
    pub fn resolve(&self, endpoint: &str) -> Result<Url> {
        match Url::parse(endpoint) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.base_url.as_ref().ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "Relative endpoint {} with no base URL configured",
                        endpoint
                    ))
                })?;
                base.join(endpoint)
                    .map_err(|e| Error::InvalidInput(format!("Bad endpoint {}: {}", endpoint, e)))
            }
            Err(e) => Err(Error::InvalidInput(format!(
                "Bad endpoint {}: {}",
                endpoint, e
            ))),
        }
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, mutation: &QueuedMutation) -> Result<u16> {
        let url = self.resolve(&mutation.endpoint)?;
        debug!("{} {}", mutation.method, url);

        let mut request = self.http.request(Self::method(mutation.method), url);
        if mutation.method.has_body() || !mutation.payload.is_null() {
            request = request.json(&mutation.payload);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("{} {}: {}", mutation.method, mutation.endpoint, e))
            } else {
                Error::Network(format!("{} {}: {}", mutation.method, mutation.endpoint, e))
            }
        })?;

        Ok(response.status().as_u16())
    }
}

/// Scripted reply of a [`MockTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockReply {
    /// Respond with this HTTP status.
    Status(u16),
    /// Fail at the transport level.
    NetworkError,
    /// Never respond.
    Hang,
}

/// In-process transport for tests and dry runs.
///
/// Replies are scripted per endpoint; every call is recorded in order.
#[derive(Debug)]
pub struct MockTransport {
    default_reply: Mutex<MockReply>,
    replies: Mutex<HashMap<String, MockReply>>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<String>>,
    call_count: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    /// A transport that answers 200 to everything.
    pub fn new() -> Self {
        Self {
            default_reply: Mutex::new(MockReply::Status(200)),
            replies: Mutex::new(HashMap::new()),
            delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Reply for endpoints without a specific script.
    pub fn set_default_reply(&self, reply: MockReply) {
        *lock(&self.default_reply) = reply;
    }

    /// Script the reply for one endpoint.
    pub fn set_reply(&self, endpoint: impl Into<String>, reply: MockReply) {
        lock(&self.replies).insert(endpoint.into(), reply);
    }

    /// Wait this long before replying to each call.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Endpoints called so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, mutation: &QueuedMutation) -> Result<u16> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.calls).push(mutation.endpoint.clone());

        let reply = lock(&self.replies)
            .get(&mutation.endpoint)
            .copied()
            .unwrap_or_else(|| *lock(&self.default_reply));
        let delay = *lock(&self.delay);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match reply {
            MockReply::Status(status) => Ok(status),
            MockReply::NetworkError => {
                Err(Error::Network(format!("connection refused: {}", mutation.endpoint)))
            }
            MockReply::Hang => std::future::pending().await,
        }
    }
}
