//! Control API served under `/api` on the proxy listeners.
//!
//! Read-only routes are public; everything under `/api/admin/` requires the
//! static key from the configuration, passed as an `X-API-Key` header or an
//! `api_key` query parameter.

use crate::acme::CertificateManager;
use crate::config::Config;
use crate::discovery::Discovery;
use crate::error::{json_error_response, ProxyErrorCode, RegistryError};
use crate::health::{HealthChecker, HealthRecord};
use crate::registry::{Project, ProjectPatch, RegistrationRequest, Registry};
use crate::stats::StatsCollector;
use chrono::{DateTime, Utc};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode, Uri};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Everything the API routes need, shared across listeners.
pub struct ApiState {
    registry: Arc<Registry>,
    health: Arc<HealthChecker>,
    discovery: Arc<Discovery>,
    stats: Arc<StatsCollector>,
    certs: Arc<CertificateManager>,
    admin_api_key: Option<String>,
    uptime_window_hours: i64,
    acme_enabled: bool,
    started: Instant,
}

/// Health fields attached to project listings.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBrief {
    healthy: bool,
    status_code: u16,
    response_time_ms: u64,
    last_check: DateTime<Utc>,
}

impl From<HealthRecord> for HealthBrief {
    fn from(record: HealthRecord) -> Self {
        Self {
            healthy: record.healthy,
            status_code: record.status_code,
            response_time_ms: record.response_time_ms,
            last_check: record.timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotatedProject {
    #[serde(flatten)]
    project: Project,
    health: Option<HealthBrief>,
}

impl ApiState {
    pub fn new(
        registry: Arc<Registry>,
        health: Arc<HealthChecker>,
        discovery: Arc<Discovery>,
        stats: Arc<StatsCollector>,
        certs: Arc<CertificateManager>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            health,
            discovery,
            stats,
            certs,
            admin_api_key: config.server.admin_api_key.clone(),
            uptime_window_hours: config.health.uptime_window_hours,
            acme_enabled: config.acme.enabled,
            started: Instant::now(),
        }
    }

    /// Dispatch an `/api/...` request. Never fails; every error becomes a
    /// JSON error response.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        if path.starts_with("/api/admin/") {
            if let Err(resp) = authorize(self.admin_api_key.as_deref(), &req) {
                return resp;
            }
        }

        match (method, path.as_str()) {
            // Public
            (Method::GET, "/api") | (Method::GET, "/api/") => self.api_info(),
            (Method::GET, "/api/health") => self.system_health(),
            (Method::GET, "/api/projects") => self.list_projects(&req),
            (Method::GET, p) if p.starts_with("/api/projects/") && p.ends_with("/health") => {
                let subdomain = p
                    .trim_start_matches("/api/projects/")
                    .trim_end_matches("/health")
                    .to_string();
                self.project_health(&subdomain).await
            }
            (Method::GET, p) if p.starts_with("/api/projects/") => {
                let subdomain = p.trim_start_matches("/api/projects/");
                self.get_project(subdomain)
            }
            (Method::GET, "/api/discovery/scan") => self.run_scan().await,

            // Admin (authorized above)
            (Method::POST, "/api/admin/projects") => self.create_project(req).await,
            (Method::PUT, p) if p.starts_with("/api/admin/projects/") => {
                let subdomain = p.trim_start_matches("/api/admin/projects/").to_string();
                self.update_project(&subdomain, req).await
            }
            (Method::DELETE, p) if p.starts_with("/api/admin/projects/") => {
                let subdomain = p.trim_start_matches("/api/admin/projects/");
                self.delete_project(subdomain)
            }
            (Method::POST, "/api/admin/discovery/scan") => self.run_scan().await,
            (Method::GET, "/api/admin/health/check") => self.run_health_check().await,
            (Method::GET, p) if p.starts_with("/api/admin/health/diagnostics/") => {
                let name = p.trim_start_matches("/api/admin/health/diagnostics/");
                self.project_diagnostics(name)
            }
            (Method::GET, "/api/admin/stats") => self.platform_stats(),
            (Method::POST, "/api/admin/ssl/generate") => self.generate_certificate(),
            (Method::GET, "/api/admin/ssl/info") => self.certificate_info(),

            _ => json_error_response(ProxyErrorCode::NotFound, "Unknown API endpoint"),
        }
    }

    // ==================== Public Routes ====================

    fn api_info(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let info = serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
            "endpoints": {
                "health": "/api/health",
                "projects": "/api/projects",
                "project": "/api/projects/:subdomain",
                "projectHealth": "/api/projects/:subdomain/health",
                "discoveryScan": "/api/discovery/scan",
                "admin": "/api/admin/* (X-API-Key required)",
            },
        });
        json_response(StatusCode::OK, info.to_string())
    }

    fn system_health(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let summary = self.health.summary();
        let status = if summary.unhealthy == 0 { "ok" } else { "degraded" };
        let body = serde_json::json!({
            "status": status,
            "name": PKG_NAME,
            "version": VERSION,
            "uptimeSecs": self.started.elapsed().as_secs(),
            "projects": summary,
            "timestamp": Utc::now(),
        });
        json_response(StatusCode::OK, body.to_string())
    }

    fn list_projects(&self, req: &Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let uri = req.uri();
        let mut projects = self.registry.list();
        if let Some(kind) = query_param(uri, "type") {
            projects.retain(|p| p.project_type == kind);
        }
        if let Some(status) = query_param(uri, "status") {
            projects.retain(|p| p.status.to_string() == status);
        }
        if let Some(tag) = query_param(uri, "tag") {
            projects.retain(|p| p.tags.iter().any(|t| t == &tag));
        }

        let annotated: Vec<AnnotatedProject> = projects
            .into_iter()
            .map(|project| {
                let health = self
                    .health
                    .last_record(&project.subdomain)
                    .map(HealthBrief::from);
                AnnotatedProject { project, health }
            })
            .collect();

        json_body(
            StatusCode::OK,
            &serde_json::json!({ "count": annotated.len(), "projects": annotated }),
        )
    }

    async fn project_health(&self, subdomain: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self.health.check_subdomain(subdomain).await {
            Ok(record) => {
                let uptime = self.health.uptime(subdomain, self.uptime_window_hours);
                let recent = self.health.history(subdomain, 10);
                json_response(
                    StatusCode::OK,
                    serde_json::json!({
                        "check": record,
                        "uptime": uptime,
                        "recentChecks": recent,
                    })
                    .to_string(),
                )
            }
            Err(e) => registry_error(e),
        }
    }

    fn get_project(&self, subdomain: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self.registry.get(subdomain) {
            Some(project) => {
                let health = self.health.last_record(subdomain).map(HealthBrief::from);
                let uptime = self.health.uptime(subdomain, self.uptime_window_hours);
                json_response(
                    StatusCode::OK,
                    serde_json::json!({
                        "project": project,
                        "health": health,
                        "uptime": uptime,
                    })
                    .to_string(),
                )
            }
            None => json_error_response(
                ProxyErrorCode::ProjectNotFound,
                format!("Project with subdomain '{}' not found", subdomain),
            ),
        }
    }

    async fn run_scan(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self.discovery.scan_and_update().await {
            Ok(summary) => json_response(
                StatusCode::OK,
                serde_json::json!({
                    "message": "Scan complete",
                    "summary": summary,
                    "lastScan": self.discovery.last_scan(),
                })
                .to_string(),
            ),
            Err(e) => {
                error!(error = %e, "Discovery scan failed");
                json_error_response(
                    ProxyErrorCode::DiscoveryFailed,
                    format!("Discovery scan failed: {}", e),
                )
            }
        }
    }

    // ==================== Project Management ====================

    async fn create_project(
        &self,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let request: RegistrationRequest = match read_json_body(req).await {
            Ok(v) => v,
            Err(resp) => return resp,
        };
        match self.registry.register(request) {
            Ok(project) => json_body(
                StatusCode::CREATED,
                &serde_json::json!({ "message": "Project registered", "project": project }),
            ),
            Err(e) => registry_error(e),
        }
    }

    async fn update_project(
        &self,
        subdomain: &str,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let patch: ProjectPatch = match read_json_body(req).await {
            Ok(v) => v,
            Err(resp) => return resp,
        };
        match self.registry.update(subdomain, patch) {
            Ok(project) => json_body(
                StatusCode::OK,
                &serde_json::json!({ "message": "Project updated", "project": project }),
            ),
            Err(e) => registry_error(e),
        }
    }

    fn delete_project(&self, subdomain: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self.registry.unregister(subdomain) {
            Ok(project) => json_body(
                StatusCode::OK,
                &serde_json::json!({ "message": "Project unregistered", "project": project }),
            ),
            Err(e) => registry_error(e),
        }
    }

    // ==================== Health & Stats ====================

    async fn run_health_check(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let checks = self.health.check_all().await;
        json_response(
            StatusCode::OK,
            serde_json::json!({
                "checks": checks,
                "summary": self.health.summary(),
            })
            .to_string(),
        )
    }

    fn project_diagnostics(&self, name: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self.health.diagnostics(name) {
            Some(diagnostics) => json_body(StatusCode::OK, &diagnostics),
            None => json_error_response(
                ProxyErrorCode::ProjectNotFound,
                format!("No project named '{}'", name),
            ),
        }
    }

    fn platform_stats(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_response(
            StatusCode::OK,
            serde_json::json!({
                "registry": self.registry.stats(),
                "health": self.health.summary(),
                "proxy": self.stats.aggregated(),
                "lastScan": self.discovery.last_scan(),
            })
            .to_string(),
        )
    }

    // ==================== Certificates ====================

    fn generate_certificate(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        if self.certs.is_issuing() {
            let mut resp = json_response(
                StatusCode::CONFLICT,
                serde_json::json!({
                    "code": "CERTIFICATE_ERROR",
                    "message": "Certificate issuance already in progress",
                    "status": 409,
                })
                .to_string(),
            );
            resp.headers_mut()
                .insert("x-proxy-error", HeaderValue::from_static("CERTIFICATE_ERROR"));
            return resp;
        }

        let certs = Arc::clone(&self.certs);
        tokio::spawn(async move {
            match certs.issue().await {
                Ok(()) => info!("Certificate issuance finished"),
                Err(e) => error!(error = %e, "Certificate issuance failed"),
            }
        });

        json_response(
            StatusCode::ACCEPTED,
            serde_json::json!({
                "message": "Certificate issuance started; watch the server console for DNS challenge instructions",
            })
            .to_string(),
        )
    }

    fn certificate_info(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_response(
            StatusCode::OK,
            serde_json::json!({
                "certificate": self.certs.cert_info(),
                "acmeEnabled": self.acme_enabled,
            })
            .to_string(),
        )
    }
}

// ==================== Helper Functions ====================

/// Helper to create a JSON response
fn json_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

fn json_body<T: Serialize>(
    status: StatusCode,
    value: &T,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    match serde_json::to_string(value) {
        Ok(body) => json_response(status, body),
        Err(e) => {
            error!(error = %e, "Failed to serialize API response");
            json_error_response(ProxyErrorCode::InternalError, "Failed to serialize response")
        }
    }
}

fn registry_error(err: RegistryError) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(err.code(), err.to_string())
}

/// First value for `key` in the request query string. Values are plain
/// tokens; no percent-decoding is applied.
fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

/// Admin gate: 501 when no key is configured, 401 on a wrong or missing key.
fn authorize<B>(
    admin_key: Option<&str>,
    req: &Request<B>,
) -> Result<(), Response<BoxBody<Bytes, hyper::Error>>> {
    let Some(expected) = admin_key else {
        return Err(json_error_response(
            ProxyErrorCode::AdminNotConfigured,
            "Admin API is disabled; set server.admin_api_key to enable it",
        ));
    };

    let presented = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query_param(req.uri(), "api_key"));

    match presented {
        Some(key) if key == expected => Ok(()),
        _ => {
            warn!(path = %req.uri().path(), "Unauthorized admin API request");
            Err(json_error_response(
                ProxyErrorCode::Unauthorized,
                "Invalid or missing API key",
            ))
        }
    }
}

async fn read_json_body<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, Response<BoxBody<Bytes, hyper::Error>>> {
    let bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Err(json_error_response(
                ProxyErrorCode::ValidationError,
                format!("Failed to read request body: {}", e),
            ))
        }
    };

    serde_json::from_slice(&bytes).map_err(|e| {
        json_error_response(
            ProxyErrorCode::ValidationError,
            format!("Invalid JSON body: {}", e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(path_and_query: &str, key_header: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(path_and_query);
        if let Some(key) = key_header {
            builder = builder.header("x-api-key", key);
        }
        builder.body(()).expect("request")
    }

    #[test]
    fn test_query_param_parsing() {
        let uri: Uri = "/api/projects?type=web&status=healthy&tag=demo"
            .parse()
            .expect("uri");
        assert_eq!(query_param(&uri, "type"), Some("web".to_string()));
        assert_eq!(query_param(&uri, "status"), Some("healthy".to_string()));
        assert_eq!(query_param(&uri, "tag"), Some("demo".to_string()));
        assert_eq!(query_param(&uri, "missing"), None);

        let bare: Uri = "/api/projects".parse().expect("uri");
        assert_eq!(query_param(&bare, "type"), None);
    }

    #[test]
    fn test_authorize_not_configured() {
        let req = request_with("/api/admin/stats", Some("whatever"));
        let err = authorize(None, &req).expect_err("should refuse");
        assert_eq!(err.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(
            err.headers().get("x-proxy-error").map(|v| v.as_bytes()),
            Some(&b"ADMIN_NOT_CONFIGURED"[..])
        );
    }

    #[test]
    fn test_authorize_missing_or_wrong_key() {
        let missing = request_with("/api/admin/stats", None);
        let err = authorize(Some("secret"), &missing).expect_err("missing key");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let wrong = request_with("/api/admin/stats", Some("nope"));
        let err = authorize(Some("secret"), &wrong).expect_err("wrong key");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_authorize_accepts_header_and_query() {
        let via_header = request_with("/api/admin/stats", Some("secret"));
        assert!(authorize(Some("secret"), &via_header).is_ok());

        let via_query = request_with("/api/admin/stats?api_key=secret", None);
        assert!(authorize(Some("secret"), &via_query).is_ok());
    }
}
