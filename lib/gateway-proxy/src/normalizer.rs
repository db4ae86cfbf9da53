//! Conversion of every failure into the gateway's single JSON error envelope
//!
//! Every error response has the shape `{"message": ..., "error": <status>,
//! "details": ...}` with the HTTP status equal to `error`. Backend error
//! replies never pass through here; they are forwarded unchanged.

use crate::error::{AuthError, ProxyError};
use http_body_util::Full;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{body::Bytes, Response, StatusCode};
use serde::Serialize;
use tracing::{error, warn};

pub const SERVICE_UNAVAILABLE_MESSAGE: &str = "service temporarily unavailable";

/// Normalized error, serialized as the response body
#[derive(Clone, Debug, Serialize)]
pub struct GatewayError {
    pub message: String,
    #[serde(rename = "error")]
    pub error_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip)]
    pub headers: HeaderMap,
}

impl GatewayError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: status.as_u16(),
            details: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<serde_json::Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_header(mut self, name: hyper::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.error_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let body = serde_json::to_vec(&self)
            .unwrap_or_else(|_| br#"{"message":"internal server error","error":500}"#.to_vec());

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = self.status();
        response.headers_mut().extend(self.headers);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

/// Maps [`ProxyError`]s to [`GatewayError`]s.
///
/// Internal details only reach the caller in debug mode; they are always
/// logged.
#[derive(Clone, Copy, Debug, Default)]
pub struct ErrorNormalizer {
    debug: bool,
}

impl ErrorNormalizer {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    pub fn normalize(&self, err: &ProxyError) -> GatewayError {
        match err {
            ProxyError::RouteNotFound(path) => {
                GatewayError::new(StatusCode::NOT_FOUND, "service not found for path").with_details(path.as_str())
            }
            ProxyError::Auth(AuthError::Inactive) => GatewayError::new(StatusCode::FORBIDDEN, "inactive user"),
            ProxyError::Auth(reason) => GatewayError::new(StatusCode::UNAUTHORIZED, "could not validate credentials")
                .with_details(reason.to_string())
                .with_header(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer")),
            ProxyError::ServiceUnavailable(service) => {
                warn!(service = %service, "Rejecting request: service unhealthy");
                GatewayError::new(StatusCode::SERVICE_UNAVAILABLE, SERVICE_UNAVAILABLE_MESSAGE)
            }
            ProxyError::Upstream { service, source } => {
                warn!(service = %service, kind = source.kind(), "Upstream failure: {}", source);
                let error = GatewayError::new(StatusCode::SERVICE_UNAVAILABLE, SERVICE_UNAVAILABLE_MESSAGE);
                if self.debug {
                    error.with_details(source.to_string())
                } else {
                    error
                }
            }
            ProxyError::Validation(reason) => {
                GatewayError::new(StatusCode::BAD_REQUEST, "invalid request").with_details(reason.as_str())
            }
            ProxyError::PayloadTooLarge(limit) => GatewayError::new(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
                .with_details(format!("limit is {} bytes", limit)),
            ProxyError::Core(_) | ProxyError::Internal(_) => {
                error!("Internal gateway error: {:#}", err);
                let error = GatewayError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
                if self.debug {
                    error.with_details(format!("{:#}", err))
                } else {
                    error
                }
            }
        }
    }
}
