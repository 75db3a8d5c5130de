//! Error taxonomy for the proxy data plane.
//!
//! Each enum maps onto the client-facing status codes and JSON error body
//! described for the gateway: a small `{error, request_id}` document, no
//! internal detail leaked.

use actix_web::{http::StatusCode, HttpResponse};
use serde::Serialize;

/// Failures raised while selecting a backend, crossing the circuit breaker,
/// and forwarding a request upstream.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ProxyError {
    #[error("no route matched {path}")]
    NoRouteMatched { path: String },

    #[error("method {method} not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("no healthy backend available")]
    NoHealthyBackend,

    #[error("circuit open for {route_id}/{backend}")]
    CircuitOpen { route_id: String, backend: String },

    #[error("upstream timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("connection error reaching {backend}: {message}")]
    ConnectionError { backend: String, message: String },

    #[error("connection reset by {backend}")]
    ConnectionReset { backend: String },

    #[error("tls error reaching {backend}: {message}")]
    TlsError { backend: String, message: String },

    #[error("upstream responded {status}")]
    UpstreamStatus { status: u16 },

    #[error("request canceled")]
    Canceled,

    #[error("middleware rejected the request: {0}")]
    Middleware(#[from] MiddlewareError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Classifies the error for circuit-breaker and retry-engine accounting
    /// per the failure classifier in the circuit breaker component: 5xx,
    /// connection errors, TLS errors and timeouts are failures; everything
    /// else (including 4xx other than 408) is a success for breaker purposes.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Timeout { .. }
                | ProxyError::ConnectionError { .. }
                | ProxyError::ConnectionReset { .. }
                | ProxyError::TlsError { .. }
                | ProxyError::UpstreamStatus { status: 500..=599 }
                | ProxyError::UpstreamStatus { status: 408 }
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoRouteMatched { .. } => StatusCode::NOT_FOUND,
            ProxyError::MethodNotAllowed { .. } => StatusCode::NOT_FOUND,
            ProxyError::NoHealthyBackend => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ConnectionError { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::ConnectionReset { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::TlsError { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamStatus { status } if (500..600).contains(status) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::UpstreamStatus { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Canceled => StatusCode::from_u16(499).unwrap(),
            ProxyError::Middleware(e) => e.status_code(),
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum MiddlewareError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden")]
    Forbidden,
    #[error("rate limited")]
    RateLimited,
}

impl MiddlewareError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            MiddlewareError::BadRequest(_) => StatusCode::BAD_REQUEST,
            MiddlewareError::Unauthenticated => StatusCode::UNAUTHORIZED,
            MiddlewareError::Forbidden => StatusCode::FORBIDDEN,
            MiddlewareError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteStoreError {
    #[error("invalid route set: {0}")]
    InvalidRouteSet(String),
    #[error("route store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("route store serialization error: {0}")]
    Serde(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// JSON body returned to clients on error: `{error, request_id}`, no
/// internal details leaked.
#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub request_id: String,
}

impl ProxyError {
    pub fn to_response(&self, request_id: &str) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
            request_id: request_id.to_string(),
        })
    }
}
