//! The gateway request handler
//!
//! Every request walks route resolution, authentication (when the route
//! requires it), the route's health policy and forwarding. Any failure along
//! the way is turned into the JSON error envelope; backend replies are
//! returned unchanged.

use crate::auth::{AuthDelegate, JwtVerifier};
use crate::error::{AuthError, ProxyError, Result};
use crate::forwarder::RequestForwarder;
use crate::health_check::{HealthCheckConfig, HealthMonitor};
use crate::http::HttpTransport;
use crate::message::QueryParams;
use crate::metrics::{MetricsCollector, MetricsMiddleware};
use crate::middleware::{LoggingMiddleware, MiddlewareChain, MiddlewareContext, SERVICE_KEY};
use crate::normalizer::ErrorNormalizer;
use crate::policy::HealthGate;
use anyhow::{anyhow, bail, Context};
use gateway_core::{GatewayConfig, RouteTable};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use std::error::Error as StdError;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const HEALTH_PATH: &str = "/health";

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");
pub const USER_ROLE_HEADER: HeaderName = HeaderName::from_static("x-user-role");

/// Shared, immutable request handler; one instance serves every connection
pub struct Gateway {
    routes: Arc<RouteTable>,
    health: HealthGate,
    forwarder: RequestForwarder,
    auth: Option<AuthDelegate>,
    normalizer: ErrorNormalizer,
    middleware: MiddlewareChain,
    metrics: MetricsCollector,
    max_body_bytes: usize,
}

impl Gateway {
    /// Build every component from configuration.
    ///
    /// Fails when an enabled route requires authentication and no JWT key
    /// is configured.
    pub fn from_config(config: &GatewayConfig, transport: Arc<dyn HttpTransport>) -> anyhow::Result<Self> {
        config.validate().context("Invalid gateway configuration")?;

        let routes = Arc::new(RouteTable::new(config.routes()).context("Invalid route table")?);
        for route in routes.enabled() {
            info!(
                service = %route.name,
                "Route {} -> {} (auth: {}, health: {:?})",
                if route.path_prefix.is_empty() { "/" } else { route.path_prefix.as_str() },
                route.base_url,
                route.requires_auth,
                route.health_policy
            );
        }

        let needs_auth = routes.enabled().any(|route| route.requires_auth);
        let auth = if config.jwt.is_configured() {
            let verifier = JwtVerifier::from_settings(&config.jwt)?;
            Some(AuthDelegate::new(Arc::new(verifier)))
        } else if needs_auth {
            bail!("Routes require authentication but no JWT secret or public key is configured");
        } else {
            None
        };

        let monitor = HealthMonitor::new(
            routes.clone(),
            transport.clone(),
            HealthCheckConfig::from(&config.health),
        );
        let metrics = MetricsCollector::new()?;
        let middleware = MiddlewareChain::new()
            .add(LoggingMiddleware)
            .add(MetricsMiddleware::new(metrics.clone()));

        Ok(Self {
            routes,
            health: HealthGate::new(Arc::new(monitor)),
            forwarder: RequestForwarder::new(transport, config.forward_timeout()),
            auth,
            normalizer: ErrorNormalizer::new(config.debug),
            middleware,
            metrics,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn with_auth(mut self, auth: AuthDelegate) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_middleware(mut self, middleware: MiddlewareChain) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        self.health.monitor()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Handle one inbound request. Never fails: errors become envelopes.
    pub async fn handle<B>(&self, request: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();
        let request_id = request_id(&parts.headers);
        let context = MiddlewareContext::new(parts.method.clone(), parts.uri.path(), request_id.clone(), &parts.headers);

        let mut response = match self.route_request(parts, body, &context).await {
            Ok(response) => response,
            Err(err) => {
                if let Err(e) = self.middleware.on_error(&context, &err.to_string()).await {
                    debug!("Middleware on_error error: {}", e);
                }
                self.normalizer.normalize(&err).into_response()
            }
        };

        if !response.headers().contains_key(&REQUEST_ID_HEADER) {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(REQUEST_ID_HEADER.clone(), value);
            }
        }

        if let Err(e) = self.middleware.on_response(&context, response.status().as_u16()).await {
            debug!("Middleware on_response error: {}", e);
        }

        response
    }

    async fn route_request<B>(
        &self,
        mut parts: Parts,
        body: B,
        context: &MiddlewareContext,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let path = parts.uri.path().to_string();
        if path == HEALTH_PATH {
            return self.health_response().await;
        }

        // Outbound URLs collapse dot segments past the resolved prefix
        let dot_segment = has_dot_segment(&path);
        let route = if dot_segment { None } else { self.routes.resolve(&path) };
        if let Some(route) = route {
            context.set_metadata(SERVICE_KEY, route.name.as_str());
        }
        self.middleware.on_request(context).await?;

        if dot_segment {
            return Err(ProxyError::Validation(format!("path contains dot segments: {}", path)));
        }
        let route = route.ok_or_else(|| ProxyError::RouteNotFound(path.clone()))?;

        // Identity headers are only ever set by the gateway
        parts.headers.remove(&USER_ID_HEADER);
        parts.headers.remove(&USER_ROLE_HEADER);

        if route.requires_auth {
            let auth = self
                .auth
                .as_ref()
                .ok_or_else(|| anyhow!("route {} requires authentication but none is configured", route.name))?;
            let principal = auth.authenticate(&parts.headers)?;
            debug!(service = %route.name, subject = %principal.subject_id, "Authenticated request");

            let subject = HeaderValue::from_str(&principal.subject_id).map_err(|_| AuthError::Malformed)?;
            let role = HeaderValue::from_str(&principal.role).map_err(|_| AuthError::Malformed)?;
            parts.headers.insert(USER_ID_HEADER.clone(), subject);
            parts.headers.insert(USER_ROLE_HEADER.clone(), role);
        }

        self.health.admit(route).await?;
        if let Some(record) = self.health.monitor().cached(&route.name) {
            self.metrics.record_health(&route.name, record.status);
        }

        let body = read_body(body, self.max_body_bytes).await?;
        let query = QueryParams::parse(parts.uri.query().unwrap_or(""));
        if let Ok(value) = HeaderValue::from_str(&context.request_id) {
            parts.headers.insert(REQUEST_ID_HEADER.clone(), value);
        }

        match self
            .forwarder
            .forward(route, parts.method, route.subpath(&path), &parts.headers, query, body)
            .await
        {
            Ok(response) => Ok(response.into_response()),
            Err(source) => {
                self.health.monitor().invalidate(&route.name);
                self.metrics.record_upstream_error(&route.name, source.kind());
                Err(ProxyError::Upstream {
                    service: route.name.clone(),
                    source,
                })
            }
        }
    }

    /// Aggregate health of every enabled service
    async fn health_response(&self) -> Result<Response<Full<Bytes>>> {
        let report = self.health.monitor().check_all().await;
        for (name, service) in &report.services {
            self.metrics.record_health(name, service.status);
        }

        let body = serde_json::to_vec(&report).map_err(anyhow::Error::from)?;
        let mut response = Response::new(Full::new(Bytes::from(body)));
        if !report.is_ok() {
            *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        }
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(response)
    }
}

/// The caller's `X-Request-ID`, or a fresh UUID
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(&REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// True when any segment is `.` or `..`, literally or percent-encoded
fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// Buffer the inbound body, enforcing the size limit
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!("Request body exceeds {} bytes", limit);
            Err(ProxyError::PayloadTooLarge(limit))
        }
        Err(e) => Err(ProxyError::Validation(format!("failed to read request body: {}", e))),
    }
}
