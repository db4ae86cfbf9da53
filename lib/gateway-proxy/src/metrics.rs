//! Prometheus metrics for the gateway

use crate::health_check::HealthStatus;
use crate::middleware::{Middleware, MiddlewareContext};
use anyhow::Result;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::debug;

/// Prometheus metrics collector for gateway traffic
#[derive(Clone)]
pub struct MetricsCollector {
    /// Requests by resolved service and method
    pub requests_total: CounterVec,
    /// Responses by status code
    pub responses_total: CounterVec,
    /// End-to-end latency by service
    pub request_duration_seconds: HistogramVec,
    /// Forwarding failures by service and kind
    pub upstream_errors_total: CounterVec,
    /// Last observed health verdict per service (1 = ok)
    pub service_healthy: IntGaugeVec,
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = CounterVec::new(
            Opts::new("gateway_requests_total", "Total requests by resolved service"),
            &["service", "method"],
        )?;

        let responses_total = CounterVec::new(
            Opts::new("gateway_responses_total", "Total responses by status"),
            &["status"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("gateway_request_duration_seconds", "Request latency in seconds"),
            &["service"],
        )?;

        let upstream_errors_total = CounterVec::new(
            Opts::new("gateway_upstream_errors_total", "Backend network failures"),
            &["service", "kind"],
        )?;

        let service_healthy = IntGaugeVec::new(
            Opts::new("gateway_service_healthy", "Last health verdict per service (1 = ok)"),
            &["service"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(responses_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(upstream_errors_total.clone()))?;
        registry.register(Box::new(service_healthy.clone()))?;

        Ok(Self {
            requests_total,
            responses_total,
            request_duration_seconds,
            upstream_errors_total,
            service_healthy,
            registry,
        })
    }

    pub fn record_upstream_error(&self, service: &str, kind: &str) {
        self.upstream_errors_total.with_label_values(&[service, kind]).inc();
    }

    pub fn record_health(&self, service: &str, status: HealthStatus) {
        let value = i64::from(status == HealthStatus::Ok);
        self.service_healthy.with_label_values(&[service]).set(value);
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Feeds the collector from the middleware hooks
pub struct MetricsMiddleware {
    pub collector: MetricsCollector,
}

impl MetricsMiddleware {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }
}

#[async_trait::async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "MetricsMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        self.collector
            .requests_total
            .with_label_values(&[context.service().as_str(), context.method.as_str()])
            .inc();
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        debug!("Recording response metrics for {} {} -> {}", context.method, context.path, status);

        self.collector
            .responses_total
            .with_label_values(&[status.to_string().as_str()])
            .inc();
        self.collector
            .request_duration_seconds
            .with_label_values(&[context.service().as_str()])
            .observe(context.elapsed().as_secs_f64());
        Ok(())
    }
}
