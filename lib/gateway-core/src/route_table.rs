//! Immutable route table mapping path prefixes to backend services

use crate::{CoreError, Result, ServiceRoute};
use std::collections::HashMap;
use tracing::{debug, info};

/// RouteTable holds every configured service route.
///
/// It is built once at startup and never mutated, so it can be shared
/// behind an `Arc` without locking. Disabled routes (empty base URL) are
/// kept for lookup by name but never match a path.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<ServiceRoute>,
    by_name: HashMap<String, usize>,
}

impl RouteTable {
    /// Build the table, failing if two enabled routes share a prefix
    pub fn new(routes: Vec<ServiceRoute>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(routes.len());
        let mut by_prefix: HashMap<String, String> = HashMap::new();

        for (idx, route) in routes.iter().enumerate() {
            if by_name.insert(route.name.clone(), idx).is_some() {
                return Err(CoreError::InvalidConfiguration(format!(
                    "service {} is configured twice",
                    route.name
                )));
            }

            if !route.is_enabled() {
                info!(service = %route.name, "Route disabled: no base URL configured");
                continue;
            }

            if let Some(existing) = by_prefix.insert(route.path_prefix.clone(), route.name.clone()) {
                return Err(CoreError::DuplicatePrefix {
                    prefix: route.path_prefix.clone(),
                    first: existing,
                    second: route.name.clone(),
                });
            }

            debug!(
                service = %route.name,
                prefix = %route.path_prefix,
                base_url = %route.base_url,
                "Registered route"
            );
        }

        Ok(Self { routes, by_name })
    }

    /// Resolve a request path to the enabled route with the longest matching prefix
    pub fn resolve(&self, path: &str) -> Option<&ServiceRoute> {
        self.enabled()
            .filter(|route| route.matches(path))
            .max_by_key(|route| route.path_prefix.len())
    }

    /// Look up a route by service name
    pub fn get(&self, name: &str) -> Result<&ServiceRoute> {
        self.by_name
            .get(name)
            .map(|&idx| &self.routes[idx])
            .ok_or_else(|| CoreError::ServiceNotFound(name.to_string()))
    }

    /// Iterate enabled routes in configuration order
    pub fn enabled(&self) -> impl Iterator<Item = &ServiceRoute> {
        self.routes.iter().filter(|route| route.is_enabled())
    }

    /// Get count of configured routes, including disabled ones
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
