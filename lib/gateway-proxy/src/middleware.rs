//! Middleware hooks around each gateway request

use anyhow::Result;
use hyper::header::HeaderMap;
use hyper::Method;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, span, warn, Instrument, Level};

/// Metadata key holding the resolved service name
pub const SERVICE_KEY: &str = "service";

/// Context passed through middleware chain
#[derive(Clone)]
pub struct MiddlewareContext {
    pub method: Method,
    pub path: String,
    /// Correlation id for the request
    pub request_id: String,
    pub request_headers: HeaderMap,
    pub started_at: Instant,
    /// Custom metadata for middleware
    pub metadata: Arc<Mutex<HashMap<String, String>>>,
}

impl MiddlewareContext {
    pub fn new(method: Method, path: impl Into<String>, request_id: impl Into<String>, headers: &HeaderMap) -> Self {
        Self {
            method,
            path: path.into(),
            request_id: request_id.into(),
            request_headers: headers.clone(),
            started_at: Instant::now(),
            metadata: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Get a metadata value
    pub fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata.lock().ok().and_then(|m| m.get(key).cloned())
    }

    /// Set a metadata value
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut m) = self.metadata.lock() {
            m.insert(key.into(), value.into());
        }
    }

    /// Resolved service name, or `-` before route resolution
    pub fn service(&self) -> String {
        self.get_metadata(SERVICE_KEY).unwrap_or_else(|| "-".to_string())
    }
}

/// Middleware trait for processing requests and responses
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    /// Called after route lookup, before any rejection or forwarding
    async fn on_request(&self, _context: &MiddlewareContext) -> Result<()> {
        Ok(())
    }

    /// Called with the final status of every request
    async fn on_response(&self, _context: &MiddlewareContext, _status: u16) -> Result<()> {
        Ok(())
    }

    /// Called when the request ends in a gateway error
    async fn on_error(&self, _context: &MiddlewareContext, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Chain of middleware to execute in order
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add middleware to the chain
    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Process request through all middleware
    pub async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_request(context).instrument(span).await?;
        }
        Ok(())
    }

    /// Process response through all middleware (in reverse order)
    pub async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        for mw in self.middleware.iter().rev() {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_response(context, status).instrument(span).await?;
        }
        Ok(())
    }

    /// Process error through all middleware
    pub async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_error(context, error).instrument(span).await?;
        }
        Ok(())
    }
}

/// Access log with the request id on every line
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        debug!(
            request_id = %context.request_id,
            service = %context.service(),
            "Request: {} {} (headers: {})",
            context.method,
            context.path,
            context.request_headers.len()
        );
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        info!(
            request_id = %context.request_id,
            service = %context.service(),
            status,
            "{} {} -> {} ({}ms)",
            context.method,
            context.path,
            status,
            context.elapsed().as_millis()
        );
        Ok(())
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        warn!(
            request_id = %context.request_id,
            service = %context.service(),
            "Error: {} {} - {}",
            context.method,
            context.path,
            error
        );
        Ok(())
    }
}
