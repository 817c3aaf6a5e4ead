/// Request-path error taxonomy
use http::StatusCode;
use thiserror::Error;

/// Errors produced while resolving or forwarding a single request.
///
/// None of these are fatal to the process. The dispatcher turns every variant
/// into an HTTP response via [`ProxyError::status`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    /// No configured path prefix matches the request path
    #[error("no matching route")]
    NoMatchingRoute,
    /// The matched route has no configured backends
    #[error("no backends")]
    NoBackends,
    /// Every backend of the matched route is currently unhealthy
    #[error("no healthy backends")]
    NoHealthyBackends,
    /// The forwarding attempt failed at the transport level
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),
    /// The forwarding attempt exceeded its deadline or the caller went away
    #[error("backend timeout")]
    BackendTimeout,
}

impl ProxyError {
    /// HTTP status the error is surfaced as
    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_GATEWAY
    }

    /// Whether another attempt against a fresh balancer selection may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::BackendUnreachable(_) | ProxyError::BackendTimeout
        )
    }
}
