//! Subdomain-routing proxy listener.
//!
//! Resolves the request Host to a registered project, gates on the last
//! health verdict, and relays to the upstream on `127.0.0.1:<port>` through
//! the shared connection pool. Websocket upgrades become a raw TCP relay
//! once the upstream answers 101.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ApiState, PKG_NAME, VERSION};
use crate::error::{json_error_response, json_error_response_with, ProxyErrorCode};
use crate::health::HealthChecker;
use crate::pool::ConnectionPool;
use crate::registry::Registry;
use crate::stats::StatsCollector;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_REAL_IP: &str = "x-real-ip";
const X_PROXY: &str = "x-subgate-proxy";
const X_RESPONSE_TIME: &str = "x-response-time";

/// Longest hostname DNS allows (RFC 1035).
const MAX_HOSTNAME_LEN: usize = 253;

/// Routing state shared by every listener.
pub struct ProxyContext {
    pub registry: Arc<Registry>,
    pub health: Arc<HealthChecker>,
    pub stats: Arc<StatsCollector>,
    pub pool: Arc<ConnectionPool>,
    pub api: Arc<ApiState>,
    /// Lowercased base domain that subdomains hang off of.
    pub base_domain: String,
    /// Upper bound for a single forwarded request.
    pub proxy_timeout: Duration,
}

/// One proxy listener bound to an address, plain or TLS.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    tls_acceptor: Option<TlsAcceptor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        ctx: Arc<ProxyContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            ctx,
            tls_acceptor: None,
            shutdown_rx,
        }
    }

    /// Serve TLS on this listener with the given acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.bind_addr, protocol, "Proxy listener started (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, ctx, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, ctx, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %self.bind_addr, "Proxy listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        let client_addr = addr;
        async move { handle_request(req, ctx, client_addr, is_tls).await }
    });

    // auto::Builder serves both HTTP/1.1 and HTTP/2 on the same port;
    // HTTP/1.1 connections can still carry websocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Control API is path-routed and answers on every host
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return Ok(ctx.api.handle(req).await);
    }

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::ValidationError,
                "Missing or invalid Host header",
            ));
        }
    };

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let subdomain = match extract_subdomain(&hostname, &ctx.base_domain) {
        Some(s) => s,
        None => return Ok(root_domain_response(&ctx)),
    };

    let project = match ctx.registry.get(&subdomain) {
        Some(project) => project,
        None => {
            warn!(subdomain, "No project registered for subdomain");
            let available: Vec<String> = ctx
                .registry
                .list_active()
                .into_iter()
                .map(|p| p.subdomain)
                .collect();
            return Ok(json_error_response_with(
                ProxyErrorCode::ProjectNotFound,
                format!("No project registered for {}.{}", subdomain, ctx.base_domain),
                json!({ "subdomain": subdomain, "availableSubdomains": available }),
            ));
        }
    };

    // Never-checked counts as unhealthy; the startup sweep and the periodic
    // checker keep this current for registered projects.
    if !ctx.health.is_healthy(&subdomain) {
        warn!(subdomain, project = %project.name, "Refusing to route to unhealthy service");
        return Ok(json_error_response_with(
            ProxyErrorCode::ServiceUnhealthy,
            "The requested service is currently unhealthy",
            json!({ "subdomain": subdomain, "lastCheck": ctx.health.last_check(&subdomain) }),
        ));
    }

    // Outbound header rewrite. Overwrites any client-supplied values so the
    // upstream only sees what this hop put there.
    let original_host = req.headers().get(hyper::header::HOST).cloned();
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_REAL_IP, value);
    }

    headers.insert(X_PROXY, HeaderValue::from_static(VERSION));

    // The upstream expects to be addressed as itself, not as the public host
    if let Ok(value) = HeaderValue::from_str(&format!("127.0.0.1:{}", project.port)) {
        headers.insert(hyper::header::HOST, value);
    }

    if is_upgrade_request(&req) {
        return handle_upgrade(req, ctx, hostname, subdomain, project.port, request_id).await;
    }

    ctx.stats.record_request(&hostname);
    let started = Instant::now();

    let result = tokio::time::timeout(ctx.proxy_timeout, ctx.pool.send_request(req, project.port)).await;

    match result {
        Ok(Ok(mut response)) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            ctx.stats
                .record_response(&hostname, response.status().as_u16(), elapsed_ms);

            let headers = response.headers_mut();
            headers.insert(X_PROXY, HeaderValue::from_static(VERSION));
            if let Ok(value) = HeaderValue::from_str(&format!("{}ms", elapsed_ms)) {
                headers.insert(X_RESPONSE_TIME, value);
            }

            debug!(hostname, status = %response.status(), elapsed_ms, "Forwarded response");
            Ok(response)
        }
        Ok(Err(e)) => {
            ctx.stats.record_error(&hostname);
            error!(subdomain, port = project.port, error = %e, "Failed to forward request");
            Ok(upstream_error(&subdomain, &request_id))
        }
        Err(_) => {
            ctx.stats.record_error(&hostname);
            warn!(
                subdomain,
                port = project.port,
                timeout_secs = ctx.proxy_timeout.as_secs(),
                "Upstream request timed out"
            );
            Ok(upstream_error(&subdomain, &request_id))
        }
    }
}

/// Status payload served on the bare base domain.
fn root_domain_response(ctx: &ProxyContext) -> Response<BoxBody<Bytes, hyper::Error>> {
    let projects: Vec<serde_json::Value> = ctx
        .registry
        .list_active()
        .into_iter()
        .map(|p| {
            let status = if ctx.health.is_healthy(&p.subdomain) {
                "healthy"
            } else {
                "unhealthy"
            };
            json!({ "name": p.name, "subdomain": p.subdomain, "status": status })
        })
        .collect();

    let body = json!({
        "name": PKG_NAME,
        "version": VERSION,
        "baseDomain": ctx.base_domain,
        "projects": projects,
        "endpoints": {
            "api": "/api",
            "health": "/api/health",
            "projects": "/api/projects",
        },
    })
    .to_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Stable 502 body for any transport failure talking to the upstream.
fn upstream_error(subdomain: &str, request_id: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response_with(
        ProxyErrorCode::UpstreamError,
        "The requested service is not responding",
        json!({ "subdomain": subdomain, "requestId": request_id }),
    )
}

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req.headers().get(hyper::header::HOST)?.to_str().ok()?;

    // Strip :port, then hold the rest to hostname rules: non-empty, at most
    // 253 characters, alphanumerics plus hyphen and dot
    let hostname = raw.split(':').next()?;
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// Leftmost label of `hostname` when it is a proper subdomain of the base
/// domain: at least three labels and the base as a dot-bounded suffix.
/// Anything else is a root-domain request.
fn extract_subdomain(hostname: &str, base_domain: &str) -> Option<String> {
    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() < 3 {
        return None;
    }

    let prefix = hostname.strip_suffix(base_domain)?;
    if !prefix.ends_with('.') {
        return None;
    }

    let subdomain = labels[0];
    if subdomain.is_empty() {
        return None;
    }

    Some(subdomain.to_string())
}

/// Check if a request asks for a protocol upgrade (websockets, mostly)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Get the value of the Upgrade header
fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Serialize the inbound request as a raw HTTP/1.1 upgrade request for the
/// upstream. The Host header is rewritten to the upstream address.
fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    use std::fmt::Write;

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut raw = String::with_capacity(256);
    let _ = write!(
        raw,
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n",
        req.method(),
        path,
        port
    );
    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            let _ = write!(raw, "{}: {}\r\n", name, v);
        }
    }
    raw.push_str("\r\n");

    raw.into_bytes()
}

/// Parse the upstream's HTTP response to check for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let head = text.split_once("\r\n\r\n").map(|(h, _)| h).unwrap_or(text);
    let mut lines = head.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let mut status_line = lines.next()?.splitn(3, ' ');
    let _version = status_line.next()?;
    let code: u16 = status_line.next()?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

/// Relay a protocol upgrade: forward the handshake over a fresh TCP
/// connection, then splice bytes both ways until either side closes.
async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    hostname: String,
    subdomain: String,
    port: u16,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(subdomain, request_id, upgrade_type, "Handling upgrade request");

    ctx.stats.record_request(&hostname);
    let started = Instant::now();

    let raw_request = build_upgrade_request(&req, port);

    let upstream_addr = format!("127.0.0.1:{}", port);
    let mut upstream = match TcpStream::connect(&upstream_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            ctx.stats.record_error(&hostname);
            error!(subdomain, port, error = %e, "Failed to connect to upstream for upgrade");
            return Ok(upstream_error(&subdomain, &request_id));
        }
    };

    if let Err(e) = upstream.write_all(&raw_request).await {
        ctx.stats.record_error(&hostname);
        error!(subdomain, error = %e, "Failed to send upgrade request to upstream");
        return Ok(upstream_error(&subdomain, &request_id));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match upstream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            ctx.stats.record_error(&hostname);
            error!(subdomain, "Upstream closed connection before answering upgrade");
            return Ok(upstream_error(&subdomain, &request_id));
        }
        Err(e) => {
            ctx.stats.record_error(&hostname);
            error!(subdomain, error = %e, "Failed to read upgrade response from upstream");
            return Ok(upstream_error(&subdomain, &request_id));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
        Some(parsed) => parsed,
        None => {
            ctx.stats.record_error(&hostname);
            error!(subdomain, "Failed to parse upstream upgrade response");
            return Ok(upstream_error(&subdomain, &request_id));
        }
    };

    ctx.stats
        .record_response(&hostname, status.as_u16(), started.elapsed().as_millis() as u64);

    if status != StatusCode::SWITCHING_PROTOCOLS {
        // Relay the upstream's refusal as-is
        warn!(subdomain, status = %status, "Upstream rejected upgrade request");
        return Ok(relay_handshake_response(status, &response_headers));
    }

    info!(subdomain, request_id, upgrade_type, "Websocket upgrade successful");
    let response = relay_handshake_response(status, &response_headers);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(subdomain, request_id, "Client upgrade complete, relaying");
                forward_bidirectional(upgraded, upstream, &subdomain, &request_id).await;
            }
            Err(e) => {
                error!(subdomain, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// Copy the upstream's handshake verdict onto a hyper response. Framing
/// headers stay behind; hyper writes its own.
fn relay_handshake_response(
    status: StatusCode,
    headers: &[(String, String)],
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), hv);
        }
    }
    builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Forward bytes bidirectionally between the client and upstream connections
async fn forward_bidirectional(
    client: Upgraded,
    upstream: TcpStream,
    subdomain: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    let mut upstream_io = upstream;

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                subdomain,
                request_id,
                client_to_upstream,
                upstream_to_client,
                "Websocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(subdomain, request_id, error = %e, "Websocket connection closed with error");
        }
    }
}
