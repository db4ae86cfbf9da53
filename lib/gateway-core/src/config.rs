//! Gateway configuration
//!
//! Configuration is read once at startup from a YAML file and then patched
//! from environment variables. Nothing here is reloaded at runtime; route
//! changes require a restart.

use crate::{CoreError, HealthPolicy, Result, ServiceRoute};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "gateway.yaml";

/// Top-level gateway configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the HTTP listener binds to
    pub listen_addr: String,
    /// Expose internal error details in error envelopes
    pub debug: bool,
    /// Timeout for a whole forwarded call
    pub forward_timeout_secs: u64,
    /// Largest inbound body the gateway will buffer
    pub max_body_bytes: usize,
    pub health: HealthSettings,
    pub jwt: JwtSettings,
    pub services: BTreeMap<String, ServiceConfig>,
}

/// Health probing settings shared by all services
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// How long a probe result is trusted
    pub ttl_secs: u64,
    /// Timeout for a single probe request
    pub probe_timeout_ms: u64,
    /// Overall budget for the concurrent candidate probes
    pub probe_budget_ms: u64,
    /// Health endpoints tried after the service's own health path
    pub candidate_paths: Vec<String>,
}

/// JWT verification settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtSettings {
    pub algorithm: Algorithm,
    /// Shared secret for HMAC algorithms
    pub secret: Option<String>,
    /// PEM public key for RSA/EC/EdDSA algorithms
    pub public_key_pem: Option<String>,
    pub leeway_secs: u64,
}

/// One backend service as written in the config file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub prefix: String,
    pub health_path: Option<String>,
    pub requires_auth: bool,
    pub health_policy: HealthPolicy,
    pub service_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let services = [
            ("auth", "/auth", false),
            ("courses", "/courses", true),
            ("rooms", "/rooms", true),
            ("competitions", "/competitions", true),
            ("achievements", "/achievements", true),
        ]
        .into_iter()
        .map(|(name, prefix, requires_auth)| {
            (
                name.to_string(),
                ServiceConfig {
                    prefix: prefix.to_string(),
                    requires_auth,
                    ..Default::default()
                },
            )
        })
        .collect();

        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            debug: false,
            forward_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            health: HealthSettings::default(),
            jwt: JwtSettings::default(),
            services,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            probe_timeout_ms: 1500,
            probe_budget_ms: 3000,
            candidate_paths: vec!["/health".to_string(), "/api/v1/health".to_string()],
        }
    }
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::HS256,
            secret: None,
            public_key_pem: None,
            leeway_secs: 0,
        }
    }
}

impl JwtSettings {
    /// Whether a verification key for the configured algorithm is present
    pub fn is_configured(&self) -> bool {
        let present = |value: &Option<String>| value.as_deref().map_or(false, |v| !v.trim().is_empty());
        match self.algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => present(&self.secret),
            _ => present(&self.public_key_pem),
        }
    }
}

impl HealthSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_budget(&self) -> Duration {
        Duration::from_millis(self.probe_budget_ms)
    }
}

impl GatewayConfig {
    /// Load configuration from `GATEWAY_CONFIG` (or `gateway.yaml`), then apply
    /// environment overrides.
    ///
    /// A missing default file falls back to built-in defaults; a missing file
    /// named explicitly through the environment is an error.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if Path::new(&path).exists() {
            info!("Loading gateway configuration from {}", path);
            Self::from_file(&path)?
        } else if explicit.is_some() {
            return Err(CoreError::InvalidConfiguration(format!(
                "config file {} does not exist",
                path
            )));
        } else {
            info!("No configuration file found, using built-in defaults");
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Patch settings from environment-style key lookups.
    ///
    /// Service URLs are read from `<NAME>_SERVICE_URL` with the service name
    /// upper-cased and dashes replaced by underscores.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("GATEWAY_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(debug) = lookup("GATEWAY_DEBUG") {
            self.debug = matches!(debug.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.jwt.secret = Some(secret);
        }
        if let Some(key) = lookup("JWT_PUBLIC_KEY") {
            self.jwt.public_key_pem = Some(key);
        }
        if let Some(algorithm) = lookup("JWT_ALGORITHM") {
            match algorithm.parse::<Algorithm>() {
                Ok(alg) => self.jwt.algorithm = alg,
                Err(e) => debug!("Ignoring JWT_ALGORITHM={}: {}", algorithm, e),
            }
        }

        for (name, service) in self.services.iter_mut() {
            let key = format!("{}_SERVICE_URL", name.to_ascii_uppercase().replace('-', "_"));
            if let Some(url) = lookup(&key) {
                debug!(service = %name, "Service URL overridden by {}", key);
                service.base_url = url;
            }
        }
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.health.probe_timeout_ms == 0 || self.health.probe_budget_ms == 0 {
            return Err(CoreError::InvalidConfiguration(
                "health probe timeout and budget must be non-zero".to_string(),
            ));
        }
        if self.forward_timeout() <= self.health.probe_timeout() {
            return Err(CoreError::InvalidConfiguration(
                "forward timeout must be longer than the health probe timeout".to_string(),
            ));
        }
        for (name, service) in &self.services {
            let url = service.base_url.trim();
            if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(CoreError::InvalidConfiguration(format!(
                    "service {} has a base URL without an http(s) scheme: {}",
                    name, url
                )));
            }
        }
        Ok(())
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    /// Turn the configured services into routes, in name order
    pub fn routes(&self) -> Vec<ServiceRoute> {
        self.services
            .iter()
            .map(|(name, service)| {
                let mut route = ServiceRoute::new(name.clone(), service.base_url.clone(), service.prefix.clone())
                    .with_auth(service.requires_auth)
                    .with_health_policy(service.health_policy);
                if let Some(path) = &service.health_path {
                    route = route.with_health_path(path.clone());
                }
                if let Some(token) = &service.service_token {
                    route = route.with_service_token(token.clone());
                }
                route
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8000");
        assert_eq!(config.forward_timeout(), Duration::from_secs(30));
        assert_eq!(config.health.ttl(), Duration::from_secs(30));
        assert_eq!(config.services.len(), 5);
        assert!(!config.services["auth"].requires_auth);
        assert!(config.services["courses"].requires_auth);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_services_are_disabled_without_urls() {
        let routes = GatewayConfig::default().routes();
        assert!(routes.iter().all(|route| !route.is_enabled()));
    }

    #[test]
    fn test_from_yaml() {
        let raw = r#"
listen_addr: 127.0.0.1:9000
forward_timeout_secs: 10
health:
  ttl_secs: 5
jwt:
  algorithm: HS512
  secret: s3cret
services:
  auth:
    base_url: http://auth:9001
    prefix: /auth
  rooms:
    base_url: http://rooms:9003
    prefix: /rooms
    health_path: /status
    requires_auth: true
    health_policy: fail_closed
"#;
        let config = GatewayConfig::from_yaml(raw).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.health.ttl_secs, 5);
        assert_eq!(config.health.probe_timeout_ms, 1500);
        assert_eq!(config.jwt.algorithm, Algorithm::HS512);
        assert_eq!(config.jwt.secret.as_deref(), Some("s3cret"));

        let routes = config.routes();
        let rooms = routes.iter().find(|r| r.name == "rooms").unwrap();
        assert_eq!(rooms.health_path, "/status");
        assert!(rooms.requires_auth);
        assert_eq!(rooms.health_policy, HealthPolicy::FailClosed);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("AUTH_SERVICE_URL", "http://auth:9001"),
            ("JWT_SECRET", "from-env"),
            ("JWT_ALGORITHM", "HS384"),
            ("GATEWAY_DEBUG", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.services["auth"].base_url, "http://auth:9001");
        assert_eq!(config.jwt.secret.as_deref(), Some("from-env"));
        assert_eq!(config.jwt.algorithm, Algorithm::HS384);
        assert!(config.debug);
    }

    #[test]
    fn test_invalid_algorithm_override_ignored() {
        let mut config = GatewayConfig::default();
        config.apply_overrides(|key| (key == "JWT_ALGORITHM").then(|| "ROT13".to_string()));
        assert_eq!(config.jwt.algorithm, Algorithm::HS256);
    }

    #[test]
    fn test_validate_rejects_short_forward_timeout() {
        let mut config = GatewayConfig::default();
        config.forward_timeout_secs = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_schemeless_url() {
        let mut config = GatewayConfig::default();
        config.services.get_mut("auth").unwrap().base_url = "auth:9001".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jwt_is_configured() {
        let mut jwt = JwtSettings::default();
        assert!(!jwt.is_configured());

        jwt.secret = Some("  ".to_string());
        assert!(!jwt.is_configured());

        jwt.secret = Some("s3cret".to_string());
        assert!(jwt.is_configured());

        // Asymmetric algorithms need the public key, not the secret
        jwt.algorithm = Algorithm::RS256;
        assert!(!jwt.is_configured());
        jwt.public_key_pem = Some("-----BEGIN PUBLIC KEY-----".to_string());
        assert!(jwt.is_configured());
    }

    #[test]
    fn test_example_config_parses() {
        let config = GatewayConfig::from_yaml(include_str!("../../../gateway.example.yaml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.services.len(), 5);
        assert!(config.routes().iter().all(|route| route.is_enabled()));
        assert!(!config.jwt.is_configured());
    }
}
