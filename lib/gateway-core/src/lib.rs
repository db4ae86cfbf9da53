//! Core routing configuration for the campus API gateway
//!
//! This library provides:
//! - Gateway configuration loaded from YAML with environment overrides
//! - Service routes and the per-route health/auth policy
//! - The immutable route table used to resolve inbound paths

pub mod config;
pub mod error;
pub mod route;
pub mod route_table;

pub use config::{GatewayConfig, HealthSettings, JwtSettings, ServiceConfig};
pub use error::{CoreError, Result};
pub use route::{HealthPolicy, ServiceRoute};
pub use route_table::RouteTable;
