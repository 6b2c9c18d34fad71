//! Pooled HTTP client for upstream services.
//!
//! Both listeners forward through one shared client, so keep-alive
//! connections to a given local port are reused across requests instead of
//! being re-dialed per hit.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("invalid upstream target: {0}")]
    Target(String),
}

/// Pool sizing, taken from `[server]` in the config file.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Rewrites the target of an inbound request to a loopback port and sends it
/// through the pooled client. Everything else about the request (method,
/// path, query, headers, body stream) passes through untouched.
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Forward `req` to the service listening on `port`.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = upstream_uri(port, &parts.uri)?;

        let response = self.client.request(Request::from_parts(parts, body)).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Build the loopback URI for a forwarded request, keeping its path and
/// query string.
fn upstream_uri(port: u16, inbound: &Uri) -> Result<Uri, PoolError> {
    let path_and_query = inbound
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("http://127.0.0.1:{}{}", port, path_and_query)
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| PoolError::Target(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_upstream_uri_keeps_path_and_query() {
        let inbound: Uri = "http://app.example.com/v1/items?page=2&sort=asc"
            .parse()
            .unwrap();
        let rewritten = upstream_uri(3000, &inbound).unwrap();
        assert_eq!(
            rewritten.to_string(),
            "http://127.0.0.1:3000/v1/items?page=2&sort=asc"
        );
    }

    #[test]
    fn test_upstream_uri_defaults_to_root() {
        // Authority-form URIs carry no path at all
        let inbound: Uri = "app.example.com:80".parse().unwrap();
        let rewritten = upstream_uri(8080, &inbound).unwrap();
        assert_eq!(rewritten.to_string(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
    }
}
