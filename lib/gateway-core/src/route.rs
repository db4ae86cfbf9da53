//! Service route definitions
use serde::{Deserialize, Serialize};

/// What the gateway does when a service's health verdict is not OK
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthPolicy {
    /// Log the verdict and forward anyway so the caller sees the real backend error
    #[default]
    AdvisoryForward,
    /// Reject with 503 before forwarding
    FailClosed,
}

/// A backend service reachable under a path prefix
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRoute {
    pub name: String,
    pub base_url: String,
    pub path_prefix: String,
    pub health_path: String,
    pub requires_auth: bool,
    pub health_policy: HealthPolicy,
    /// Credential sent in place of the caller's Authorization header
    pub service_token: Option<String>,
}

impl ServiceRoute {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            path_prefix: normalize_prefix(&path_prefix.into()),
            health_path: "/health".to_string(),
            requires_auth: false,
            health_policy: HealthPolicy::default(),
            service_token: None,
        }
    }

    pub fn with_health_path(mut self, health_path: impl Into<String>) -> Self {
        self.health_path = health_path.into();
        self
    }

    pub fn with_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    pub fn with_health_policy(mut self, policy: HealthPolicy) -> Self {
        self.health_policy = policy;
        self
    }

    pub fn with_service_token(mut self, token: impl Into<String>) -> Self {
        self.service_token = Some(token.into());
        self
    }

    /// Routes without a base URL are disabled and never match
    pub fn is_enabled(&self) -> bool {
        !self.base_url.trim().is_empty()
    }

    /// Check whether `path` falls under this route's prefix on a segment boundary
    pub fn matches(&self, path: &str) -> bool {
        let prefix = self.path_prefix.as_str();
        if prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// The part of `path` after the prefix, always starting with '/' or empty
    pub fn subpath<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.path_prefix.as_str()).unwrap_or(path)
    }
}

/// "/auth/" and "auth" both become "/auth"; "/" becomes the catch-all ""
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(ServiceRoute::new("a", "http://a", "/auth/").path_prefix, "/auth");
        assert_eq!(ServiceRoute::new("a", "http://a", "auth").path_prefix, "/auth");
        assert_eq!(ServiceRoute::new("a", "http://a", "/").path_prefix, "");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let route = ServiceRoute::new("auth", "http://auth:9001/", "/auth");
        assert_eq!(route.base_url, "http://auth:9001");
    }

    #[test]
    fn test_segment_boundary_match() {
        let route = ServiceRoute::new("auth", "http://auth:9001", "/auth");
        assert!(route.matches("/auth"));
        assert!(route.matches("/auth/users/42"));
        assert!(!route.matches("/authors"));
        assert!(!route.matches("/courses/auth"));
    }

    #[test]
    fn test_subpath() {
        let route = ServiceRoute::new("auth", "http://auth:9001", "/auth");
        assert_eq!(route.subpath("/auth/users/42"), "/users/42");
        assert_eq!(route.subpath("/auth"), "");
    }

    #[test]
    fn test_disabled_route() {
        assert!(!ServiceRoute::new("rooms", "", "/rooms").is_enabled());
        assert!(ServiceRoute::new("rooms", "http://rooms:9003", "/rooms").is_enabled());
    }

    #[test]
    fn test_health_policy_serde() {
        let policy: HealthPolicy = serde_yaml::from_str("fail_closed").unwrap();
        assert_eq!(policy, HealthPolicy::FailClosed);
        assert_eq!(HealthPolicy::default(), HealthPolicy::AdvisoryForward);
    }
}
