//! Domain-driven configuration management for Manifold
//!
//! Configuration is split by functional domain, with defaults, validation,
//! and environment variable support layered on top of an optional YAML file.

pub mod error;
pub mod loader;
pub mod validation;

pub mod domains;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

pub use domains::{
    auth::AuthConfig, database::DatabaseConfig, gateway::GatewayConfig, logging::LoggingConfig,
    server::ServerConfig, upstream::UpstreamDefaults, watcher::WatcherConfig, ManifoldConfig,
};
