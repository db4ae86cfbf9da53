use gateway_core::CoreError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Network-level failure talking to a backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream connection failed: {0}")]
    Connection(String),

    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl UpstreamError {
    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Timeout(_) => "timeout",
            UpstreamError::Connection(_) => "connection",
            UpstreamError::Protocol(_) => "protocol",
        }
    }
}

/// Bearer credential rejection
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer credentials")]
    Missing,

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token is malformed")]
    Malformed,

    #[error("user is inactive")]
    Inactive,
}

/// Everything that can stop a request from being forwarded
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("No service configured for path {0}")]
    RouteNotFound(String),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Backend {service} failed: {source}")]
    Upstream {
        service: String,
        #[source]
        source: UpstreamError,
    },

    #[error("Service {0} is unhealthy")]
    ServiceUnavailable(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_kind() {
        assert_eq!(UpstreamError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(UpstreamError::Connection("refused".into()).kind(), "connection");
        assert_eq!(UpstreamError::Protocol("bad".into()).kind(), "protocol");
    }

    #[test]
    fn test_proxy_error_display() {
        let err = ProxyError::Upstream {
            service: "rooms".to_string(),
            source: UpstreamError::Connection("refused".to_string()),
        };
        assert_eq!(err.to_string(), "Backend rooms failed: upstream connection failed: refused");
    }
}
