/// Per-request dispatch: route, balance, cache, forward, retry
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use log::{debug, warn};
use pingora_timeout::timeout;
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::cache::{
    fingerprint, is_cacheable_request, is_cacheable_response, CacheEntry, CacheStatus,
    ResponseCache,
};
use crate::error::ProxyError;
use crate::load_balancer::Backend;
use crate::metrics::MetricsCollector;
use crate::routes::Router;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_REQUEST_ID: &str = "x-request-id";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh request ID: wall-clock nanos plus a process-wide counter
pub fn generate_request_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("req-{:016x}-{:08x}", nanos, counter)
}

/// The client's `X-Request-ID` when it sent a usable one, otherwise a fresh ID
pub fn request_id_for(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id)
}

/// Inbound request as seen by the dispatcher
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Origin-form target, path and query only
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    /// Scheme the client used to reach the proxy
    pub scheme: String,
    /// Tag carried upstream and echoed back; empty means derive it from the
    /// headers
    pub request_id: String,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: None,
            scheme: "http".to_string(),
            request_id: String::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

/// Response relayed back to the client
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Short `text/plain` response for a dispatch error
    pub fn from_error(err: &ProxyError) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self::new(err.status(), headers, Bytes::from(err.to_string()))
    }

    fn from_cache(entry: CacheEntry) -> Self {
        Self::new(entry.status, entry.headers, entry.body)
    }
}

/// Request as sent to a backend
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Absolute URL on the selected backend
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends one request to one backend
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: OutboundRequest) -> Result<ProxyResponse, ProxyError>;
}

/// reqwest-backed forwarder
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create forwarding client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: OutboundRequest) -> Result<ProxyResponse, ProxyError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        let headers = strip_hop_by_hop(response.headers());
        let body = response.bytes().await.map_err(classify_reqwest_error)?;

        Ok(ProxyResponse::new(status, headers, body))
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::BackendTimeout
    } else {
        ProxyError::BackendUnreachable(e.to_string())
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copy of `headers` without hop-by-hop fields, including any field the
/// `Connection` header names
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if !is_hop_by_hop_header(name_str) && !listed.iter().any(|t| t == name_str) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Outcome of one forwarding attempt
enum Attempt {
    Done(Result<ProxyResponse, ProxyError>),
    Cancelled,
}

/// Ties routing, balancing, caching, forwarding and metrics together
pub struct RequestDispatcher {
    router: Arc<Router>,
    cache: Arc<ResponseCache>,
    metrics: Arc<MetricsCollector>,
    forwarder: Arc<dyn Forwarder>,
    request_timeout: Duration,
    max_retries: u32,
}

impl RequestDispatcher {
    pub fn new(
        router: Arc<Router>,
        cache: Arc<ResponseCache>,
        metrics: Arc<MetricsCollector>,
        forwarder: Arc<dyn Forwarder>,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            router,
            cache,
            metrics,
            forwarder,
            request_timeout,
            max_retries,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Dispatch a request with no caller cancellation
    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        self.handle_until(request, std::future::pending::<()>()).await
    }

    /// Dispatch a request, giving up when `cancelled` completes
    ///
    /// Cancellation surfaces as `BackendTimeout` and is never retried.
    pub async fn handle_until<F>(&self, request: ProxyRequest, cancelled: F) -> ProxyResponse
    where
        F: Future<Output = ()>,
    {
        let start = Instant::now();
        self.metrics.record_request();
        let mut cancelled = std::pin::pin!(cancelled);
        let request_id = if request.request_id.is_empty() {
            request_id_for(&request.headers)
        } else {
            request.request_id.clone()
        };

        let cache_key = (self.cache.is_enabled()
            && is_cacheable_request(&request.method, &request.headers))
        .then(|| fingerprint(&request.method, &request.uri, &request.headers));

        let mut retries = 0u32;
        let (mut response, backend_url) = loop {
            let backend = match self.router.resolve(request.path()) {
                Ok(backend) => backend,
                Err(e) => break (ProxyResponse::from_error(&e), None),
            };
            let guard = backend.acquire();
            let url = guard.backend().url().to_string();

            if retries == 0 {
                if let Some(entry) = cache_key.as_deref().and_then(|key| self.cache.get(key)) {
                    debug!("Cache hit for {}", request.path_and_query());
                    let mut response = ProxyResponse::from_cache(entry);
                    CacheStatus::Hit.apply(&mut response.headers);
                    self.metrics.record_backend_request(&url);
                    self.metrics.record_backend_latency(&url, start.elapsed());
                    break (response, Some(url));
                }
            }

            let outbound = self.outbound_request(guard.backend(), &request, &request_id);
            let attempt = tokio::select! {
                biased;
                _ = &mut cancelled => Attempt::Cancelled,
                result = timeout(self.request_timeout, self.forwarder.forward(outbound)) => {
                    match result {
                        Ok(result) => Attempt::Done(result),
                        Err(_) => Attempt::Done(Err(ProxyError::BackendTimeout)),
                    }
                }
            };

            let (err, was_cancelled) = match attempt {
                Attempt::Done(Ok(mut response)) => {
                    if let Some(key) = &cache_key {
                        if is_cacheable_response(response.status, &response.headers) {
                            self.cache.put(
                                key.clone(),
                                CacheEntry::new(
                                    response.status,
                                    response.headers.clone(),
                                    response.body.clone(),
                                ),
                            );
                        }
                        CacheStatus::Miss.apply(&mut response.headers);
                    }
                    self.metrics.record_backend_request(&url);
                    self.metrics.record_backend_latency(&url, start.elapsed());
                    break (response, Some(url));
                }
                Attempt::Done(Err(e)) => (e, false),
                Attempt::Cancelled => (ProxyError::BackendTimeout, true),
            };

            self.metrics.record_backend_failure(&url);
            warn!("Backend {} failed for request {}: {}", url, request_id, err);

            if was_cancelled || !err.is_retryable() || retries >= self.max_retries {
                self.metrics.record_backend_request(&url);
                break (ProxyResponse::from_error(&err), Some(url));
            }

            retries += 1;
            self.metrics.record_retry();
            debug!(
                "Retrying {} ({}/{})",
                request.path_and_query(),
                retries,
                self.max_retries
            );
            drop(guard);
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers.insert(X_REQUEST_ID, value);
        }

        let elapsed = start.elapsed();
        let log_level = if response.status.is_server_error() {
            log::Level::Error
        } else if response.status.is_client_error() {
            log::Level::Warn
        } else {
            log::Level::Info
        };
        let remote = request
            .client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string());
        log::log!(
            log_level,
            "{} {} {} {} -> {} {} ({}ms)",
            request_id,
            remote,
            request.method,
            request.path(),
            backend_url.as_deref().unwrap_or("no-backend"),
            response.status.as_u16(),
            elapsed.as_millis()
        );

        response
    }

    /// Outbound request for `backend`: hop-by-hop headers and `Host` dropped,
    /// forwarding headers and the request ID set
    fn outbound_request(
        &self,
        backend: &Backend,
        request: &ProxyRequest,
        request_id: &str,
    ) -> OutboundRequest {
        let mut headers = strip_hop_by_hop(&request.headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        if let Some(ip) = request.client_ip {
            if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
                headers.append(X_FORWARDED_FOR, value);
            }
        }
        if let Some(host) = request.headers.get(header::HOST) {
            headers.append(X_FORWARDED_HOST, host.clone());
        }
        if let Ok(value) = HeaderValue::from_str(&request.scheme) {
            headers.append(X_FORWARDED_PROTO, value);
        }
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }

        OutboundRequest {
            url: backend.target_url(request.path_and_query()),
            method: request.method.clone(),
            headers,
            body: request.body.clone(),
        }
    }
}
