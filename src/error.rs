//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Request is missing or malformed fields
    #[error("{0}")]
    Validation(String),
    /// Subdomain is already taken
    #[error("Subdomain '{0}' is already registered")]
    Conflict(String),
    /// No project under that subdomain
    #[error("Project with subdomain '{0}' not found")]
    NotFound(String),
    /// Snapshot write failed; memory was updated but disk was not
    #[error("Failed to persist registry: {0}")]
    Storage(String),
}

impl RegistryError {
    /// Wire error code for this registry error
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            RegistryError::Validation(_) => ProxyErrorCode::ValidationError,
            RegistryError::Conflict(_) => ProxyErrorCode::SubdomainConflict,
            RegistryError::NotFound(_) => ProxyErrorCode::ProjectNotFound,
            RegistryError::Storage(_) => ProxyErrorCode::InternalError,
        }
    }
}

/// Error codes for proxy and API errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Registration request failed validation
    ValidationError,
    /// Subdomain is already registered
    SubdomainConflict,
    /// No project registered for the subdomain
    ProjectNotFound,
    /// Project exists but is not healthy
    ServiceUnhealthy,
    /// Upstream connection failed or timed out
    UpstreamError,
    /// Admin API has no key configured
    AdminNotConfigured,
    /// Admin API key missing or wrong
    Unauthorized,
    /// Discovery scan failed
    DiscoveryFailed,
    /// Certificate operation failed
    CertificateError,
    /// No such API route
    NotFound,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ProxyErrorCode::SubdomainConflict => StatusCode::CONFLICT,
            ProxyErrorCode::ProjectNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::ServiceUnhealthy => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::AdminNotConfigured => StatusCode::NOT_IMPLEMENTED,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::DiscoveryFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::CertificateError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ValidationError => "VALIDATION_ERROR",
            ProxyErrorCode::SubdomainConflict => "SUBDOMAIN_CONFLICT",
            ProxyErrorCode::ProjectNotFound => "PROJECT_NOT_FOUND",
            ProxyErrorCode::ServiceUnhealthy => "SERVICE_UNHEALTHY",
            ProxyErrorCode::UpstreamError => "UPSTREAM_ERROR",
            ProxyErrorCode::AdminNotConfigured => "ADMIN_NOT_CONFIGURED",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::DiscoveryFailed => "DISCOVERY_FAILED",
            ProxyErrorCode::CertificateError => "CERTIFICATE_ERROR",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Wire shape of every error body: `{code, message, status}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();
    coded_response(code, body)
}

/// Same shape plus extra context fields merged into the body, so routing
/// errors can carry things like the active project list or a request id.
pub fn json_error_response_with(
    code: ProxyErrorCode,
    message: impl Into<String>,
    extra: serde_json::Value,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);

    let mut body = serde_json::json!({
        "code": error.code,
        "message": error.message,
        "status": error.status,
    });
    if let (Some(obj), serde_json::Value::Object(extra)) = (body.as_object_mut(), extra) {
        for (k, v) in extra {
            obj.insert(k, v);
        }
    }

    coded_response(code, body.to_string())
}

fn coded_response(code: ProxyErrorCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::ValidationError.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::SubdomainConflict.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProxyErrorCode::ProjectNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::ServiceUnhealthy.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::UpstreamError.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::AdminNotConfigured.status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_registry_error_codes() {
        let err = RegistryError::Validation("Missing required fields: name".into());
        assert!(matches!(err.code(), ProxyErrorCode::ValidationError));

        let err = RegistryError::Conflict("app".into());
        assert!(matches!(err.code(), ProxyErrorCode::SubdomainConflict));
        assert_eq!(err.to_string(), "Subdomain 'app' is already registered");

        let err = RegistryError::NotFound("gone".into());
        assert!(matches!(err.code(), ProxyErrorCode::ProjectNotFound));
        assert_eq!(err.to_string(), "Project with subdomain 'gone' not found");
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ProjectNotFound, "No project for 'app'");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"PROJECT_NOT_FOUND\""));
        assert!(json.contains("\"message\":\"No project for 'app'\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::UpstreamError, "Connection refused");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "UPSTREAM_ERROR"
        );
    }

    #[test]
    fn test_json_error_response_with_context() {
        let response = json_error_response_with(
            ProxyErrorCode::ServiceUnhealthy,
            "Service 'app' is not responding",
            serde_json::json!({ "project": "app", "lastHealthCheck": null }),
        );

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "SERVICE_UNHEALTHY"
        );
    }
}
