//! Proxy error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use super::relay::Direction;

/// Per-request errors. Each is answered with a generic status; details only go to the log.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("No route for path '{0}'")]
    RouteNotFound(String),

    #[error("Session limit of {0} reached")]
    AtCapacity(usize),

    #[error("Cannot connect to backend {url}: {reason}")]
    BackendUnreachable { url: String, reason: String },

    #[error("Proxy is shutting down")]
    ShuttingDown,
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Self::AtCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BackendUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            Self::RouteNotFound(_) => "service not found",
            Self::AtCapacity(_) => "too many sessions",
            Self::BackendUnreachable { .. } => "cannot connect to target service",
            Self::ShuttingDown => "proxy shutting down",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), self.public_message()).into_response()
    }
}

/// Terminal I/O failure inside a session. Logged, never surfaced to a caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionIoError {
    #[error("{direction}: read failed: {reason}")]
    Read { direction: Direction, reason: String },

    #[error("{direction}: write failed: {reason}")]
    Write { direction: Direction, reason: String },
}
