//! Upstream connection management for the Manifold gateway
//!
//! One [`Connector`] per enabled upstream owns a transport, drives the MCP
//! client handshake, correlates requests with responses, and reconnects with
//! exponential backoff. The [`UpstreamRegistry`] owns every connector and
//! publishes the event bus the rest of the gateway observes; connectors are
//! never handed out for direct mutation.

pub mod backoff;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod registry;
pub mod transport;
pub mod watcher;

pub use backoff::BackoffSchedule;
pub use config::{TransportConfig, UpstreamConfig, UpstreamOptions};
pub use connector::Connector;
pub use error::{UpstreamError, UpstreamResult};
pub use events::{UpstreamEvent, UpstreamStatus};
pub use registry::UpstreamRegistry;
pub use watcher::DevWatcher;
