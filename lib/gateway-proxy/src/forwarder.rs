//! Request forwarding to backend services

use crate::error::UpstreamError;
use crate::http::HttpTransport;
use crate::message::{ForwardedRequest, ForwardedResponse, QueryParams};
use gateway_core::ServiceRoute;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONNECTION};
use hyper::{body::Bytes, Method};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

/// Forwards requests to a resolved backend with a single overall timeout.
///
/// The forwarder never retries: POST/PUT are passed through as-is and are
/// not safe to repeat.
pub struct RequestForwarder {
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
}

impl RequestForwarder {
    pub fn new(transport: Arc<dyn HttpTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the outbound request for `route` without sending it
    pub fn build_request(
        route: &ServiceRoute,
        method: Method,
        subpath: &str,
        headers: &HeaderMap,
        query: QueryParams,
        body: Bytes,
    ) -> ForwardedRequest {
        ForwardedRequest {
            method,
            target_url: Self::build_target_url(route, subpath),
            headers: Self::filter_headers(route, headers),
            query_params: query,
            body,
        }
    }

    /// `base_url + path_prefix + subpath`
    pub fn build_target_url(route: &ServiceRoute, subpath: &str) -> String {
        format!("{}{}{}", route.base_url, route.path_prefix, subpath)
    }

    /// Forward a request and return the backend's response verbatim.
    ///
    /// Backend error statuses are returned as `Ok`; only network-level
    /// failures are errors.
    pub async fn forward(
        &self,
        route: &ServiceRoute,
        method: Method,
        subpath: &str,
        headers: &HeaderMap,
        query: QueryParams,
        body: Bytes,
    ) -> Result<ForwardedResponse, UpstreamError> {
        let request = Self::build_request(route, method, subpath, headers, query, body);

        debug!(
            service = %route.name,
            "Forwarding {} {} ({} headers, {} query params)",
            request.method,
            request.target_url,
            request.headers.len(),
            request.query_params.len()
        );

        match tokio_timeout(self.timeout, self.transport.send(request)).await {
            Ok(Ok(mut response)) => {
                Self::strip_response_headers(&mut response.headers);
                debug!(service = %route.name, "Backend responded with status: {}", response.status);
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!(service = %route.name, kind = e.kind(), "Backend request error: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!(service = %route.name, "Backend request timeout after {:?}", self.timeout);
                Err(UpstreamError::Timeout(self.timeout))
            }
        }
    }

    /// Copy every end-to-end header (keeping repeated values) and apply the
    /// route's service credential, if any
    fn filter_headers(route: &ServiceRoute, headers: &HeaderMap) -> HeaderMap {
        let listed = Self::connection_tokens(headers);
        let mut filtered = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            let name_str = name.as_str();
            if Self::is_hop_by_hop_header(name_str)
                || name_str == "host"
                || name_str == "content-length"
                || listed.iter().any(|token| token == name_str)
            {
                continue;
            }
            filtered.append(name.clone(), value.clone());
        }

        if let Some(token) = &route.service_token {
            match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(value) => {
                    filtered.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!(service = %route.name, "Service token is not a valid header value, keeping caller credentials"),
            }
        }

        filtered
    }

    /// Drop connection-level framing headers from a backend response; the
    /// body is re-framed when it is written back to the caller
    pub fn strip_response_headers(headers: &mut HeaderMap) {
        let listed = Self::connection_tokens(headers);
        let hop: Vec<_> = headers
            .keys()
            .filter(|name| Self::is_hop_by_hop_header(name.as_str()) || listed.iter().any(|token| token == name.as_str()))
            .cloned()
            .collect();
        for name in hop {
            headers.remove(&name);
        }
    }

    /// Header names listed in `Connection`, lowercased
    fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
        headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .collect()
    }

    /// Check if header is hop-by-hop (should not be forwarded)
    pub fn is_hop_by_hop_header(name: &str) -> bool {
        matches!(
            name,
            "connection"
                | "keep-alive"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "te"
                | "trailer"
                | "trailers"
                | "transfer-encoding"
                | "upgrade"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hyper::StatusCode;
    use std::sync::Mutex;

    /// Records every request and answers with a fixed response
    #[derive(Default)]
    struct RecordingTransport {
        seen: Mutex<Vec<ForwardedRequest>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn send(&self, request: ForwardedRequest) -> Result<ForwardedResponse, UpstreamError> {
            self.seen.lock().unwrap().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut response = ForwardedResponse::new(StatusCode::NOT_FOUND, "{\"detail\":\"missing\"}");
            response.headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
            response.headers.insert("x-backend", HeaderValue::from_static("courses"));
            Ok(response)
        }
    }

    fn route() -> ServiceRoute {
        ServiceRoute::new("courses", "http://courses:9002", "/courses")
    }

    #[test]
    fn test_build_target_url() {
        assert_eq!(
            RequestForwarder::build_target_url(&route(), "/17/lessons"),
            "http://courses:9002/courses/17/lessons"
        );
        assert_eq!(RequestForwarder::build_target_url(&route(), ""), "http://courses:9002/courses");
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(RequestForwarder::is_hop_by_hop_header("connection"));
        assert!(RequestForwarder::is_hop_by_hop_header("keep-alive"));
        assert!(RequestForwarder::is_hop_by_hop_header("transfer-encoding"));
        assert!(!RequestForwarder::is_hop_by_hop_header("content-type"));
        assert!(!RequestForwarder::is_hop_by_hop_header("authorization"));
    }

    #[test]
    fn test_headers_filtered_and_duplicates_kept() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("gateway:8000"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer caller"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers.append("accept", HeaderValue::from_static("text/plain"));

        let request = RequestForwarder::build_request(
            &route(),
            Method::POST,
            "/",
            &headers,
            QueryParams::new(),
            Bytes::from_static(b"{}"),
        );

        assert!(request.headers.get("host").is_none());
        assert!(request.headers.get("content-length").is_none());
        assert!(request.headers.get("connection").is_none());
        assert_eq!(request.headers[AUTHORIZATION], "Bearer caller");
        assert_eq!(request.headers.get_all("accept").iter().count(), 2);
    }

    #[test]
    fn test_connection_listed_headers_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("X-Foo, close"));
        headers.append("connection", HeaderValue::from_static("x-baz"));
        headers.insert("x-foo", HeaderValue::from_static("1"));
        headers.insert("x-bar", HeaderValue::from_static("2"));
        headers.insert("x-baz", HeaderValue::from_static("3"));

        let request = RequestForwarder::build_request(
            &route(),
            Method::GET,
            "",
            &headers,
            QueryParams::new(),
            Bytes::new(),
        );
        assert!(request.headers.get("x-foo").is_none());
        assert!(request.headers.get("x-baz").is_none());
        assert_eq!(request.headers["x-bar"], "2");

        let mut response = headers.clone();
        RequestForwarder::strip_response_headers(&mut response);
        assert!(response.get("connection").is_none());
        assert!(response.get("x-foo").is_none());
        assert_eq!(response["x-bar"], "2");
    }

    #[test]
    fn test_service_token_replaces_authorization() {
        let route = route().with_service_token("internal-token");
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer caller"));

        let request = RequestForwarder::build_request(
            &route,
            Method::GET,
            "",
            &headers,
            QueryParams::new(),
            Bytes::new(),
        );
        assert_eq!(request.headers[AUTHORIZATION], "Bearer internal-token");
    }

    #[tokio::test]
    async fn test_forward_passes_request_through() {
        let transport = Arc::new(RecordingTransport::default());
        let forwarder = RequestForwarder::new(transport.clone(), Duration::from_secs(5));

        let query = QueryParams::parse("tag=a&tag=b");
        let response = forwarder
            .forward(
                &route(),
                Method::PUT,
                "/17",
                &HeaderMap::new(),
                query,
                Bytes::from_static(b"{\"title\":\"Rust\"}"),
            )
            .await
            .unwrap();

        // Backend error statuses are not forwarding errors
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.body, Bytes::from_static(b"{\"detail\":\"missing\"}"));
        assert_eq!(response.headers["x-backend"], "courses");
        assert!(response.headers.get("transfer-encoding").is_none());

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, Method::PUT);
        assert_eq!(
            seen[0].full_url().unwrap().as_str(),
            "http://courses:9002/courses/17?tag=a&tag=b"
        );
        assert_eq!(seen[0].body, Bytes::from_static(b"{\"title\":\"Rust\"}"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_timeout() {
        let transport = Arc::new(RecordingTransport {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let forwarder = RequestForwarder::new(transport.clone(), Duration::from_secs(5));

        let result = forwarder
            .forward(&route(), Method::GET, "", &HeaderMap::new(), QueryParams::new(), Bytes::new())
            .await;

        assert_eq!(result.unwrap_err(), UpstreamError::Timeout(Duration::from_secs(5)));
        // No retries
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }
}
