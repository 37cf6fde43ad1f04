//! Shared handler state

use std::sync::Arc;

use manifold_config::GatewayConfig;
use manifold_upstream::UpstreamRegistry;

use crate::audit::AuditSink;
use crate::auth::AuthService;
use crate::catalog::ToolCatalog;
use crate::session::SessionStore;

/// Everything the gateway handlers need
///
/// The gateway holds a registry handle; the registry holds no reverse handle.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<UpstreamRegistry>,
    pub catalog: Arc<ToolCatalog>,
    pub sessions: Arc<SessionStore>,
    pub auth: Arc<AuthService>,
    pub audit: Arc<AuditSink>,
    pub gateway: Arc<GatewayConfig>,
}
