//! Health monitoring for backend services
//!
//! Each enabled service has one cached [`HealthRecord`]. A record younger
//! than the TTL is trusted without touching the network. Otherwise the
//! candidate health endpoints are probed concurrently and the first HTTP 200
//! wins; if none answers, a request against the bare base URL is accepted as
//! a weaker "reachable" signal.

use crate::http::HttpTransport;
use crate::message::{ForwardedRequest, ForwardedResponse};
use chrono::{DateTime, Utc};
use gateway_core::{CoreError, HealthSettings, Result, RouteTable, ServiceRoute};
use hyper::StatusCode;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Clone, Debug)]
pub struct HealthCheckConfig {
    /// How long a probe result is trusted
    pub ttl: Duration,
    /// Timeout for a single probe
    pub probe_timeout: Duration,
    /// Overall budget for the concurrent candidate probes
    pub probe_budget: Duration,
    /// Paths probed after the route's own health path
    pub candidate_paths: Vec<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self::from(&HealthSettings::default())
    }
}

impl From<&HealthSettings> for HealthCheckConfig {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            ttl: settings.ttl(),
            probe_timeout: settings.probe_timeout(),
            probe_budget: settings.probe_budget(),
            candidate_paths: settings.candidate_paths.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unknown,
}

/// Result of the most recent probe cycle for one service
#[derive(Clone, Debug)]
pub struct HealthRecord {
    pub service_name: String,
    pub status: HealthStatus,
    /// Monotonic probe completion time, used for TTL checks
    pub checked_at: Instant,
    /// Wall-clock probe completion time, for reporting
    pub last_checked: DateTime<Utc>,
    pub last_success_endpoint: Option<String>,
    pub message: String,
    pub version: Option<String>,
}

impl HealthRecord {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Ok
    }

    pub fn age(&self) -> Duration {
        self.checked_at.elapsed()
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// Per-service state. The record is swapped whole under its lock so readers
/// never see a torn {status, last_checked, message}.
struct HealthEntry {
    record: RwLock<Option<CachedRecord>>,
    probe_lock: Mutex<()>,
    refreshing: AtomicBool,
}

#[derive(Clone)]
struct CachedRecord {
    record: HealthRecord,
    invalidated: bool,
}

impl HealthEntry {
    fn new() -> Self {
        Self {
            record: RwLock::new(None),
            probe_lock: Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }

    fn current(&self) -> Option<CachedRecord> {
        self.record.read().ok().and_then(|guard| guard.clone())
    }

    /// A record that may be served without probing.
    ///
    /// Failed verdicts are cached for the TTL too, so a struggling backend
    /// is probed at most once per TTL.
    fn fresh(&self, ttl: Duration) -> Option<HealthRecord> {
        self.current()
            .filter(|cached| !cached.invalidated && cached.record.is_fresh(ttl))
            .map(|cached| cached.record)
    }

    fn store(&self, record: HealthRecord) {
        if let Ok(mut guard) = self.record.write() {
            let newer = guard
                .as_ref()
                .map_or(true, |existing| existing.record.checked_at <= record.checked_at);
            if newer {
                *guard = Some(CachedRecord {
                    record,
                    invalidated: false,
                });
            }
        }
    }

    fn invalidate(&self) {
        if let Ok(mut guard) = self.record.write() {
            if let Some(cached) = guard.as_mut() {
                cached.invalidated = true;
            }
        }
    }
}

enum ProbeOutcome {
    /// `confirmed` is false for the weaker base-URL signal
    Healthy {
        endpoint: String,
        response: ForwardedResponse,
        confirmed: bool,
    },
    Failed(String),
}

/// Owns the health cache for every enabled service
pub struct HealthMonitor {
    routes: Arc<RouteTable>,
    transport: Arc<dyn HttpTransport>,
    config: HealthCheckConfig,
    entries: HashMap<String, HealthEntry>,
}

impl HealthMonitor {
    pub fn new(routes: Arc<RouteTable>, transport: Arc<dyn HttpTransport>, config: HealthCheckConfig) -> Self {
        let entries = routes
            .enabled()
            .map(|route| (route.name.clone(), HealthEntry::new()))
            .collect();

        debug!(
            "Health monitor created with ttl {:?}, probe timeout {:?}",
            config.ttl, config.probe_timeout
        );

        Self {
            routes,
            transport,
            config,
            entries,
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Return the cached record when it is still fresh, otherwise probe.
    ///
    /// Concurrent callers for the same service share one probe cycle.
    pub async fn ensure_healthy(&self, service_name: &str) -> Result<HealthRecord> {
        let entry = self.entry(service_name)?;
        if let Some(record) = entry.fresh(self.config.ttl) {
            return Ok(record);
        }

        let _guard = entry.probe_lock.lock().await;
        if let Some(record) = entry.fresh(self.config.ttl) {
            return Ok(record);
        }

        self.probe_and_store(service_name, entry).await
    }

    /// Probe now, ignoring the cache
    pub async fn force_check(&self, service_name: &str) -> Result<HealthRecord> {
        let entry = self.entry(service_name)?;
        let _guard = entry.probe_lock.lock().await;
        self.probe_and_store(service_name, entry).await
    }

    /// Cached record, fresh or not, without probing
    pub fn cached(&self, service_name: &str) -> Option<HealthRecord> {
        self.entries
            .get(service_name)
            .and_then(|entry| entry.current())
            .map(|cached| cached.record)
    }

    /// Whether a cached record exists and may be trusted without probing
    pub fn is_fresh(&self, service_name: &str) -> bool {
        self.entries
            .get(service_name)
            .map_or(false, |entry| entry.fresh(self.config.ttl).is_some())
    }

    /// Mark the service's record stale so the next check probes again
    pub fn invalidate(&self, service_name: &str) {
        if let Some(entry) = self.entries.get(service_name) {
            debug!(service = %service_name, "Health record invalidated");
            entry.invalidate();
        }
    }

    /// Refresh a service's record on a background task.
    ///
    /// At most one background refresh per service is in flight; returns
    /// `None` when one already is or the service is unknown.
    pub fn refresh_in_background(self: &Arc<Self>, service_name: &str) -> Option<JoinHandle<()>> {
        let entry = self.entries.get(service_name)?;
        if entry.refreshing.swap(true, Ordering::AcqRel) {
            return None;
        }

        let guard = RefreshGuard {
            monitor: Arc::clone(self),
            name: service_name.to_string(),
        };
        Some(tokio::spawn(async move {
            if let Err(e) = guard.monitor.ensure_healthy(&guard.name).await {
                warn!(service = %guard.name, "Background health refresh failed: {}", e);
            }
        }))
    }

    /// Check every enabled service concurrently and aggregate the verdicts
    pub async fn check_all(&self) -> HealthReport {
        let checks = self.routes.enabled().map(|route| async move {
            let record = self.ensure_healthy(&route.name).await;
            (route.name.clone(), record)
        });

        let mut services = BTreeMap::new();
        for (name, record) in futures::future::join_all(checks).await {
            let health = match record {
                Ok(record) => ServiceHealth::from(&record),
                Err(e) => ServiceHealth {
                    status: HealthStatus::Unknown,
                    message: e.to_string(),
                    endpoint: None,
                    version: None,
                },
            };
            services.insert(name, health);
        }

        HealthReport::new(services)
    }

    fn entry(&self, service_name: &str) -> Result<&HealthEntry> {
        self.entries
            .get(service_name)
            .ok_or_else(|| CoreError::ServiceNotFound(service_name.to_string()))
    }

    async fn probe_and_store(&self, service_name: &str, entry: &HealthEntry) -> Result<HealthRecord> {
        let route = self.routes.get(service_name)?;
        let previous = entry.current().map(|cached| cached.record);
        let record = self.probe(route, previous.as_ref()).await;

        match record.status {
            HealthStatus::Ok => debug!(service = %service_name, "Service healthy: {}", record.message),
            _ => warn!(service = %service_name, status = ?record.status, "Service unhealthy: {}", record.message),
        }

        entry.store(record.clone());
        Ok(record)
    }

    /// Health paths to try, in order: the route's own path, then the
    /// configured candidates, without duplicates
    pub fn candidate_paths(&self, route: &ServiceRoute) -> Vec<String> {
        let mut paths: Vec<String> = Vec::with_capacity(self.config.candidate_paths.len() + 1);
        for path in std::iter::once(&route.health_path).chain(self.config.candidate_paths.iter()) {
            if !path.is_empty() && !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }

    async fn probe(&self, route: &ServiceRoute, previous: Option<&HealthRecord>) -> HealthRecord {
        let outcome = match self.probe_candidates(route).await {
            healthy @ ProbeOutcome::Healthy { .. } => healthy,
            ProbeOutcome::Failed(reason) => {
                debug!(service = %route.name, "Health endpoints failed ({}), trying base URL", reason);
                self.probe_base_url(route).await
            }
        };

        let (status, endpoint, message, version) = match outcome {
            ProbeOutcome::Healthy {
                endpoint,
                response,
                confirmed,
            } => {
                let (message, version) = if confirmed {
                    ("healthy".to_string(), extract_version(&response))
                } else {
                    ("reachable".to_string(), None)
                };
                (HealthStatus::Ok, Some(endpoint), message, version)
            }
            ProbeOutcome::Failed(reason) => {
                let ever_healthy = previous.map_or(false, |p| p.last_success_endpoint.is_some());
                let status = if ever_healthy {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Unknown
                };
                (
                    status,
                    previous.and_then(|p| p.last_success_endpoint.clone()),
                    reason,
                    previous.and_then(|p| p.version.clone()),
                )
            }
        };

        HealthRecord {
            service_name: route.name.clone(),
            status,
            checked_at: Instant::now(),
            last_checked: Utc::now(),
            last_success_endpoint: endpoint,
            message,
            version,
        }
    }

    /// Fan out to every candidate and take the first HTTP 200. Each probe
    /// runs on its own task; dropping the `JoinSet` aborts the losers as
    /// soon as a winner exists or the budget runs out.
    async fn probe_candidates(&self, route: &ServiceRoute) -> ProbeOutcome {
        let probe_timeout = self.config.probe_timeout;

        let mut probes = JoinSet::new();
        for path in self.candidate_paths(route) {
            let transport = Arc::clone(&self.transport);
            let request = ForwardedRequest::get(format!("{}{}", route.base_url, path));
            probes.spawn(async move { (path, time::timeout(probe_timeout, transport.send(request)).await) });
        }

        let race = async move {
            let mut last_error = String::from("no health endpoints configured");
            while let Some(joined) = probes.join_next().await {
                let (path, result) = match joined {
                    Ok(probe) => probe,
                    Err(e) => {
                        last_error = format!("probe task failed: {}", e);
                        continue;
                    }
                };
                match result {
                    Ok(Ok(response)) if response.status == StatusCode::OK => {
                        return ProbeOutcome::Healthy {
                            endpoint: path,
                            response,
                            confirmed: true,
                        };
                    }
                    Ok(Ok(response)) => last_error = format!("{} returned {}", path, response.status),
                    Ok(Err(e)) => last_error = format!("{}: {}", path, e),
                    Err(_) => last_error = format!("{} timed out after {:?}", path, probe_timeout),
                }
            }
            ProbeOutcome::Failed(last_error)
        };

        match time::timeout(self.config.probe_budget, race).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Failed(format!(
                "health probes exceeded budget of {:?}",
                self.config.probe_budget
            )),
        }
    }

    /// Anything below 500 from the base URL means the service is at least up
    async fn probe_base_url(&self, route: &ServiceRoute) -> ProbeOutcome {
        let request = ForwardedRequest::get(format!("{}/", route.base_url));
        match time::timeout(self.config.probe_timeout, self.transport.send(request)).await {
            Ok(Ok(response)) if response.status.as_u16() < 500 => ProbeOutcome::Healthy {
                endpoint: "/".to_string(),
                response,
                confirmed: false,
            },
            Ok(Ok(response)) => ProbeOutcome::Failed(format!("base URL returned {}", response.status)),
            Ok(Err(e)) => ProbeOutcome::Failed(e.to_string()),
            Err(_) => ProbeOutcome::Failed(format!(
                "base URL timed out after {:?}",
                self.config.probe_timeout
            )),
        }
    }
}

fn extract_version(response: &ForwardedResponse) -> Option<String> {
    let body: serde_json::Value = serde_json::from_slice(&response.body).ok()?;
    match body.get("version")? {
        serde_json::Value::String(v) => Some(v.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// One service's entry in the aggregate report
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl From<&HealthRecord> for ServiceHealth {
    fn from(record: &HealthRecord) -> Self {
        Self {
            status: record.status,
            message: record.message.clone(),
            endpoint: record.last_success_endpoint.clone(),
            version: record.version.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Ok,
    Degraded,
}

/// Aggregate `/health` report
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub services: BTreeMap<String, ServiceHealth>,
}

impl HealthReport {
    pub fn new(services: BTreeMap<String, ServiceHealth>) -> Self {
        let status = if services.values().all(|s| s.status == HealthStatus::Ok) {
            OverallStatus::Ok
        } else {
            OverallStatus::Degraded
        };
        if status == OverallStatus::Degraded {
            info!(
                "Gateway degraded: {} of {} services unhealthy",
                services.values().filter(|s| s.status != HealthStatus::Ok).count(),
                services.len()
            );
        }
        Self { status, services }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OverallStatus::Ok
    }
}

/// Clears a service's in-flight refresh flag when the refresh task ends,
/// including by panic or abort
struct RefreshGuard {
    monitor: Arc<HealthMonitor>,
    name: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.monitor.entries.get(&self.name) {
            entry.refreshing.store(false, Ordering::Release);
        }
    }
}
