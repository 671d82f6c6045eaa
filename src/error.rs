//! Domain errors and JSON error responses for the admin API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failure while materializing a site directory
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid tenant id '{0}'")]
    InvalidTenantId(String),

    #[error("invalid tenant domain {0:?}")]
    InvalidDomain(String),

    #[error("template directory not found: {0}")]
    MissingTemplate(String),

    #[error("template error in {file}: {message}")]
    Template { file: String, message: String },

    #[error("dependency install failed: {0}")]
    Install(String),

    #[error("build command failed: {0}")]
    Command(String),

    #[error("{step} timed out after {secs}s")]
    Timeout { step: String, secs: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while starting a site process
#[derive(Debug, Error)]
pub enum StartError {
    #[error("site did not become ready within {0}s")]
    Timeout(u64),

    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("process exited before becoming ready (exit code {code:?})")]
    ProcessExit { code: Option<i32> },

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// No free port left in the configured range
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no free port in range {low}-{high}")]
pub struct PortsExhausted {
    pub low: u16,
    pub high: u16,
}

/// Failure in the reverse-proxy control plane
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid hostname '{0}'")]
    InvalidHost(String),

    #[error("invalid tenant id '{0}'")]
    InvalidTenantId(String),

    #[error("port {0} is outside 1024-65535")]
    InvalidPort(u16),

    #[error("failed to write rule for '{tenant}': {source}")]
    Write {
        tenant: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy reload failed: {0}")]
    Reload(String),
}

/// Error surfaced by site lifecycle operations
#[derive(Debug, Error)]
pub enum SiteError {
    #[error("unknown tenant '{0}'")]
    UnknownTenant(String),

    #[error("site '{0}' has not been materialized")]
    NotMaterialized(String),

    #[error("site '{tenant}' is {status}, not ready")]
    NotReady { tenant: String, status: String },

    #[error("tenant directory error: {0}")]
    Tenant(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Ports(#[from] PortsExhausted),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SiteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SiteError::UnknownTenant(_) => ErrorCode::UnknownTenant,
            SiteError::NotMaterialized(_) => ErrorCode::SiteNotFound,
            SiteError::NotReady { .. } => ErrorCode::SiteNotReady,
            SiteError::Tenant(_) => ErrorCode::TenantDirectoryError,
            SiteError::Build(BuildError::InvalidTenantId(_)) => ErrorCode::InvalidTenantId,
            SiteError::Build(_) => ErrorCode::BuildFailed,
            SiteError::Start(_) => ErrorCode::StartFailed,
            SiteError::Ports(_) => ErrorCode::PortsExhausted,
            SiteError::Proxy(_) => ErrorCode::ProxyError,
            SiteError::Store(_) => ErrorCode::InternalError,
        }
    }
}

/// Error codes for admin API errors
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// Malformed request
    BadRequest,
    /// Tenant id fails validation
    InvalidTenantId,
    /// Tenant directory does not know the tenant
    UnknownTenant,
    /// No site record exists
    SiteNotFound,
    /// Site record is not ready
    SiteNotReady,
    /// Tenant directory could not be reached
    TenantDirectoryError,
    /// Build pipeline failed
    BuildFailed,
    /// Process failed to start
    StartFailed,
    /// Port range is fully reserved
    PortsExhausted,
    /// Rule write or reload failed
    ProxyError,
    /// No such route
    NotFound,
    /// Internal error
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidTenantId => StatusCode::BAD_REQUEST,
            ErrorCode::UnknownTenant => StatusCode::NOT_FOUND,
            ErrorCode::SiteNotFound => StatusCode::NOT_FOUND,
            ErrorCode::SiteNotReady => StatusCode::CONFLICT,
            ErrorCode::TenantDirectoryError => StatusCode::BAD_GATEWAY,
            ErrorCode::BuildFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::StartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::PortsExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ProxyError => StatusCode::BAD_GATEWAY,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Previewgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::InvalidTenantId => "INVALID_TENANT_ID",
            ErrorCode::UnknownTenant => "UNKNOWN_TENANT",
            ErrorCode::SiteNotFound => "SITE_NOT_FOUND",
            ErrorCode::SiteNotReady => "SITE_NOT_READY",
            ErrorCode::TenantDirectoryError => "TENANT_DIRECTORY_ERROR",
            ErrorCode::BuildFailed => "BUILD_FAILED",
            ErrorCode::StartFailed => "START_FAILED",
            ErrorCode::PortsExhausted => "PORTS_EXHAUSTED",
            ErrorCode::ProxyError => "PROXY_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
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

/// Create a JSON error response with X-Previewgate-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Previewgate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
