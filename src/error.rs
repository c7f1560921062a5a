//! Error types and HTTP status code mapping.

use hyper::{Response, StatusCode};
use std::fmt;

use crate::proxy::{BoxBody, full_body};

/// Every failure the gateway can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum GatewayError {
    /// The configuration file could not be loaded or parsed.
    Config(String),
    /// A registry mutation was given malformed input (bad prefix or URL).
    InvalidInput(String),
    /// The request path matched no registered prefix.
    PathNotFound,
    /// The named upstream record does not exist in the registry.
    ServiceNotFound { prefix: String, name: String },
    /// The prefix exists but has no upstreams registered.
    NoUpstreamsForPath(String),
    /// Every upstream for the prefix is currently marked unhealthy.
    AllUpstreamsUnhealthy(String),
    /// The circuit breaker for the selected upstream is open.
    BreakerOpen(String),
    /// The client exceeded its per-minute request budget.
    RateLimited,
    /// Authentication failed for a protected prefix.
    Unauthorized,
    /// The upstream was unreachable or the forwarding transport failed.
    Forwarding(String),
    /// The coordination store failed in a context that cannot fail open.
    Storage(String),
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::PathNotFound => write!(f, "service not found"),
            Self::ServiceNotFound { prefix, name } => {
                write!(f, "service {name} not registered under {prefix}")
            }
            Self::NoUpstreamsForPath(prefix) => {
                write!(f, "no upstreams registered for {prefix}")
            }
            Self::AllUpstreamsUnhealthy(prefix) => {
                write!(f, "all upstreams unhealthy for {prefix}")
            }
            Self::BreakerOpen(name) => write!(f, "circuit open for upstream {name}"),
            Self::RateLimited => write!(f, "rate limit exceeded"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Forwarding(msg) => write!(f, "upstream error: {msg}"),
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Storage(_) | Self::Internal(_) | Self::InvalidInput(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::PathNotFound | Self::ServiceNotFound { .. } => StatusCode::NOT_FOUND,
            Self::NoUpstreamsForPath(_)
            | Self::AllUpstreamsUnhealthy(_)
            | Self::BreakerOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forwarding(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// The short machine-readable kind used in response bodies and as the
    /// `type` label of `gateway_errors_total`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::InvalidInput(_) => "invalid_input",
            Self::PathNotFound => "path_not_found",
            Self::ServiceNotFound { .. } => "service_not_found",
            Self::NoUpstreamsForPath(_) => "no_upstreams",
            Self::AllUpstreamsUnhealthy(_) => "all_unhealthy",
            Self::BreakerOpen(_) => "breaker_open",
            Self::RateLimited => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::Forwarding(_) => "forwarding_error",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Converts this error into an HTTP response with a JSON body.
    pub fn into_response(self) -> Response<BoxBody> {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(body.to_string()))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(full_body(""))
                    .expect("building fallback response must not fail")
            })
    }
}

impl From<hyper::http::Error> for GatewayError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<hyper::header::InvalidHeaderValue> for GatewayError {
    fn from(err: hyper::header::InvalidHeaderValue) -> Self {
        Self::Internal(err.to_string())
    }
}
