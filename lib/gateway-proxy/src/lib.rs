//! Request handling for the campus API gateway
pub mod auth;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod health_check;
pub mod http;
pub mod message;
pub mod metrics;
pub mod middleware;
pub mod normalizer;
pub mod policy;

pub use auth::{AuthDelegate, JwtVerifier, Principal, TokenVerifier};
pub use error::{AuthError, ProxyError, Result, UpstreamError};
pub use forwarder::RequestForwarder;
pub use gateway::{Gateway, HEALTH_PATH, REQUEST_ID_HEADER};
pub use health_check::{HealthCheckConfig, HealthMonitor, HealthRecord, HealthReport, HealthStatus};
pub use http::{HttpTransport, HyperTransport};
pub use message::{ForwardedRequest, ForwardedResponse, QueryParams};
pub use metrics::{MetricsCollector, MetricsMiddleware};
pub use middleware::{LoggingMiddleware, Middleware, MiddlewareChain, MiddlewareContext};
pub use normalizer::{ErrorNormalizer, GatewayError};
pub use policy::{AdvisoryDecision, HealthGate};
