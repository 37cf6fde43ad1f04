//! The Manifold gateway core
//!
//! Ties the upstream registry, tool aggregation, session store and auth/audit
//! fast path together behind the `/mcp/{upstream_id}` endpoint family.

pub mod audit;
pub mod auth;
pub mod bootstrap;
pub mod catalog;
pub mod gateway;
pub mod router;
pub mod session;
pub mod state;

pub use audit::AuditSink;
pub use auth::{AuthContext, AuthService};
pub use bootstrap::Gateway;
pub use catalog::{ToolCatalog, ToolMapping};
pub use router::build_router;
pub use session::{Session, SessionStore};
pub use state::AppState;
