/// Pingora front end for the request dispatcher
use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, StatusCode};
use log::{debug, error, info};
use pingora_core::{
    server::{configuration::Opt, Server},
    services::background::GenBackgroundService,
    upstreams::peer::HttpPeer,
    Result as PingoraResult,
};
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};
use std::{net::IpAddr, sync::Arc, time::Instant};

use crate::{
    cache::ResponseCache,
    config::Config,
    dispatcher::{request_id_for, HttpForwarder, ProxyRequest, ProxyResponse, RequestDispatcher},
    health::{HealthMonitor, HttpProbe},
    metrics::{MetricsCollector, MetricsReport},
    routes::Router,
};

/// Per-request state carried through the Pingora hooks
#[derive(Debug)]
pub struct RequestContext {
    /// Request start time
    pub start_time: Instant,
    /// Client IP address, when the downstream is a TCP socket
    pub client_ip: Option<IpAddr>,
    /// Inbound `X-Request-ID` or a generated one
    pub request_id: String,
    /// Status written to the client
    pub status: Option<StatusCode>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            client_ip: None,
            request_id: String::new(),
            status: None,
        }
    }

    /// Get request duration
    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// How the metrics endpoint renders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricsFormat {
    Json,
    Prometheus,
}

impl MetricsFormat {
    fn from_query(query: Option<&str>) -> Self {
        let prometheus = query
            .unwrap_or("")
            .split('&')
            .any(|pair| pair == "format=prometheus");
        if prometheus {
            MetricsFormat::Prometheus
        } else {
            MetricsFormat::Json
        }
    }
}

/// Reverse proxy server: one listener for proxied traffic and the metrics path
#[derive(Clone)]
pub struct ProxyGateway {
    /// Configuration
    config: Arc<Config>,
    dispatcher: Arc<RequestDispatcher>,
    health_monitor: Arc<HealthMonitor>,
}

impl ProxyGateway {
    /// Build every component from validated configuration
    pub fn new(config: Arc<Config>) -> Result<Self> {
        config.validate()?;

        let router = Arc::new(Router::new(&config.routes));
        let cache = Arc::new(ResponseCache::new(config.cache_bytes()));
        let metrics = Arc::new(MetricsCollector::new()?);
        let forwarder = Arc::new(HttpForwarder::new()?);

        let health_monitor = Arc::new(HealthMonitor::new(
            router.backends().to_vec(),
            config.health_check_interval(),
            Arc::new(HttpProbe::new()?),
        ));

        let dispatcher = Arc::new(RequestDispatcher::new(
            router,
            cache,
            metrics,
            forwarder,
            config.request_timeout(),
            config.max_retries(),
        ));

        info!(
            "Proxy configured: {} routes, {} backends, cache {} bytes, timeout {:?}, {} retries",
            config.routes.len(),
            dispatcher.router().backends().len(),
            config.cache_bytes(),
            config.request_timeout(),
            config.max_retries()
        );

        Ok(Self {
            config,
            dispatcher,
            health_monitor,
        })
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health_monitor
    }

    /// Start the Pingora server; blocks forever
    pub fn run(&self, daemon: bool) -> Result<()> {
        info!("Starting proxy server");

        let opt = Opt {
            daemon,
            ..Default::default()
        };
        let mut server = Server::new(Some(opt))?;
        server.bootstrap();

        let mut proxy_service =
            pingora_proxy::http_proxy_service(&server.configuration, self.clone());

        let listen_addr = self.config.listen_address();
        proxy_service.add_tcp(&listen_addr);
        info!("HTTP server listening on {}", listen_addr);
        info!(
            "Metrics available at http://{}{}",
            listen_addr, self.config.metrics_path
        );

        server.add_service(proxy_service);

        // Background services start after daemonizing, so the probe loop
        // survives the fork
        if self.health_monitor.is_enabled() {
            server.add_service(GenBackgroundService::new(
                "health checks".to_string(),
                Arc::clone(&self.health_monitor),
            ));
        }

        // Run the server (this blocks forever)
        server.run_forever();
    }

    fn metrics_response(&self, format: MetricsFormat) -> ProxyResponse {
        let metrics = self.dispatcher.metrics();
        let rendered = match format {
            MetricsFormat::Json => {
                MetricsReport::new(metrics.snapshot(), self.dispatcher.cache().stats())
                    .to_json()
                    .map(|body| (body, "application/json"))
            }
            MetricsFormat::Prometheus => metrics
                .export_metrics()
                .map(|body| (body, "text/plain; version=0.0.4")),
        };

        let mut headers = http::HeaderMap::new();
        match rendered {
            Ok((body, content_type)) => {
                headers.insert(header::CONTENT_TYPE, http::HeaderValue::from_static(content_type));
                ProxyResponse::new(StatusCode::OK, headers, Bytes::from(body))
            }
            Err(e) => {
                error!("Failed to render metrics: {}", e);
                ProxyResponse::new(StatusCode::INTERNAL_SERVER_ERROR, headers, Bytes::new())
            }
        }
    }
}

/// Read the full downstream request body
async fn read_body(session: &mut Session) -> PingoraResult<Bytes> {
    let mut body = BytesMut::new();
    while let Some(chunk) = session.read_request_body().await? {
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

/// Completes once the client closes the connection after sending its request
async fn client_disconnected(session: &mut Session) {
    match session.downstream_session.read_body_or_idle(true).await {
        Err(e) => debug!("Client went away: {}", e),
        // Nothing left to read means nothing to watch
        Ok(_) => std::future::pending::<()>().await,
    }
}

/// Write a complete response to the downstream session
async fn write_response(session: &mut Session, response: ProxyResponse) -> PingoraResult<()> {
    let mut resp_header =
        ResponseHeader::build(response.status, Some(response.headers.len() + 1))?;
    for (name, value) in &response.headers {
        resp_header.append_header(name.clone(), value.clone())?;
    }
    if !response.headers.contains_key(header::CONTENT_LENGTH) {
        resp_header.insert_header(header::CONTENT_LENGTH, response.body.len().to_string())?;
    }

    let end_of_stream = response.body.is_empty();
    session
        .write_response_header(Box::new(resp_header), end_of_stream)
        .await?;
    if !end_of_stream {
        session
            .write_response_body(Some(response.body), true)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl ProxyHttp for ProxyGateway {
    type CTX = RequestContext;

    fn new_ctx(&self) -> Self::CTX {
        RequestContext::new()
    }

    async fn early_request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<()> {
        ctx.client_ip = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|inet| inet.ip());
        ctx.request_id = request_id_for(&session.req_header().headers);

        debug!(
            "Processing request {} from {}",
            ctx.request_id,
            ctx.client_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        Ok(())
    }

    /// Every request is answered here; nothing reaches `upstream_peer`
    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<bool> {
        let (method, uri, headers) = {
            let req = session.req_header();
            (req.method.clone(), req.uri.clone(), req.headers.clone())
        };

        if uri.path() == self.config.metrics_path {
            let response = self.metrics_response(MetricsFormat::from_query(uri.query()));
            ctx.status = Some(response.status);
            write_response(session, response).await?;
            return Ok(true);
        }

        let body = read_body(session).await?;
        let mut request = ProxyRequest::new(method, uri);
        request.headers = headers;
        request.body = body;
        request.client_ip = ctx.client_ip;
        request.request_id = ctx.request_id.clone();

        // The body is fully read, so any further read resolves only when the
        // client disconnects
        let response = {
            let disconnected = client_disconnected(session);
            self.dispatcher.handle_until(request, disconnected).await
        };
        ctx.status = Some(response.status);
        write_response(session, response).await?;
        Ok(true)
    }

    async fn upstream_peer(
        &self,
        session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> PingoraResult<Box<HttpPeer>> {
        error!(
            "No upstream peer for {}: requests are dispatched in request_filter",
            session.req_header().uri.path()
        );
        Err(pingora_core::Error::new_str("No upstream peer"))
    }

    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora_core::Error>,
        ctx: &mut Self::CTX,
    ) {
        debug!(
            "Session {} finished: {} {} -> {} ({}ms)",
            ctx.request_id,
            session.req_header().method,
            session.req_header().uri.path(),
            ctx.status.map(|s| s.as_u16()).unwrap_or(0),
            ctx.duration().as_millis()
        );

        if let Some(error) = e {
            error!("Request {} encountered error: {}", ctx.request_id, error);
        }
    }
}
