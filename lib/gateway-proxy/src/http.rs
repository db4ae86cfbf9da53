//! HTTP transport used for forwarding and health probing

use crate::error::UpstreamError;
use crate::message::{ForwardedRequest, ForwardedResponse};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::{body::Bytes, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::time::Duration;
use tracing::debug;

/// Sends one request and buffers the whole response.
///
/// Timeouts are applied by callers so that forwarding and probing can use
/// different budgets over the same transport.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: ForwardedRequest) -> Result<ForwardedResponse, UpstreamError>;
}

/// Plain-HTTP transport backed by a pooled hyper client
pub struct HyperTransport {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HyperTransport {
    /// Create a transport with connection pooling
    pub fn new(connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build::<_, Full<Bytes>>(connector);

        Self { client }
    }
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn send(&self, request: ForwardedRequest) -> Result<ForwardedResponse, UpstreamError> {
        let url = request.full_url()?;
        if url.scheme() != "http" {
            return Err(UpstreamError::Protocol(format!(
                "unsupported backend scheme {} (only plain http is supported)",
                url.scheme()
            )));
        }

        let uri: Uri = url
            .as_str()
            .parse()
            .map_err(|e| UpstreamError::Protocol(format!("invalid URI {}: {}", url, e)))?;

        debug!("Sending {} {} ({} body bytes)", request.method, uri, request.body.len());

        let mut outbound = Request::new(Full::new(request.body));
        *outbound.method_mut() = request.method;
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = request.headers;

        let response = self.client.request(outbound).await.map_err(|e| {
            if e.is_connect() {
                UpstreamError::Connection(describe(&e))
            } else {
                UpstreamError::Protocol(describe(&e))
            }
        })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| UpstreamError::Protocol(format!("failed to read response body: {}", e)))?
            .to_bytes();

        debug!("Backend responded with status {} ({} bytes)", parts.status, body.len());

        Ok(ForwardedResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

/// Flatten an error and its sources into one line; hyper's top-level
/// messages alone ("client error (Connect)") hide the cause.
fn describe(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Layer(&'static str, Option<Box<Layer>>);

    impl fmt::Display for Layer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl StdError for Layer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            self.1.as_deref().map(|l| l as &(dyn StdError + 'static))
        }
    }

    #[test]
    fn test_describe_includes_sources() {
        let err = Layer("client error", Some(Box::new(Layer("connection refused", None))));
        assert_eq!(describe(&err), "client error: connection refused");
    }

    #[tokio::test]
    async fn test_https_backend_rejected() {
        let transport = HyperTransport::new(Duration::from_secs(1));
        let result = transport
            .send(ForwardedRequest::get("https://auth:9001/health"))
            .await;
        assert!(matches!(result, Err(UpstreamError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        // Bind then drop a listener so the port is very likely closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HyperTransport::new(Duration::from_secs(1));
        let result = transport
            .send(ForwardedRequest::get(format!("http://{}/health", addr)))
            .await;
        assert!(matches!(result, Err(UpstreamError::Connection(_))));
    }
}
