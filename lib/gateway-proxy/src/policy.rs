//! Per-route health policy applied before forwarding

use crate::error::{ProxyError, Result};
use crate::health_check::{HealthMonitor, HealthRecord};
use gateway_core::{HealthPolicy, ServiceRoute};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What an advisory route does with the cached health record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvisoryDecision {
    /// Fresh OK record
    Forward,
    /// Fresh non-OK record; forward anyway and log it
    ForwardDegraded,
    /// Missing or stale record; forward and refresh in the background
    ForwardAndRefresh,
}

impl AdvisoryDecision {
    pub fn decide(record: Option<&HealthRecord>, ttl: Duration, invalidated: bool) -> Self {
        match record {
            Some(record) if !invalidated && record.is_fresh(ttl) => {
                if record.is_healthy() {
                    AdvisoryDecision::Forward
                } else {
                    AdvisoryDecision::ForwardDegraded
                }
            }
            _ => AdvisoryDecision::ForwardAndRefresh,
        }
    }
}

/// Applies each route's [`HealthPolicy`] using the shared monitor
#[derive(Clone)]
pub struct HealthGate {
    monitor: Arc<HealthMonitor>,
}

impl HealthGate {
    pub fn new(monitor: Arc<HealthMonitor>) -> Self {
        Self { monitor }
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Decide whether `route` may be forwarded to.
    ///
    /// Advisory routes never wait on the network. Fail-closed routes wait
    /// for a verdict and are rejected unless it is OK.
    pub async fn admit(&self, route: &ServiceRoute) -> Result<()> {
        match route.health_policy {
            HealthPolicy::AdvisoryForward => {
                let fresh = self.monitor.is_fresh(&route.name);
                let cached = self.monitor.cached(&route.name);
                let decision = AdvisoryDecision::decide(cached.as_ref(), self.monitor.config().ttl, !fresh);

                match decision {
                    AdvisoryDecision::Forward => {}
                    AdvisoryDecision::ForwardDegraded => {
                        if let Some(record) = cached {
                            warn!(
                                service = %route.name,
                                status = ?record.status,
                                "Forwarding to unhealthy service: {}",
                                record.message
                            );
                        }
                    }
                    AdvisoryDecision::ForwardAndRefresh => {
                        debug!(service = %route.name, "Health record stale, refreshing in background");
                        self.monitor.refresh_in_background(&route.name);
                    }
                }
                Ok(())
            }
            HealthPolicy::FailClosed => {
                let record = self.monitor.ensure_healthy(&route.name).await?;
                if record.is_healthy() {
                    Ok(())
                } else {
                    Err(ProxyError::ServiceUnavailable(route.name.clone()))
                }
            }
        }
    }
}
