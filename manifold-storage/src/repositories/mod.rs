//! Repository traits and their sqlx implementations
//!
//! The gateway core depends on the traits only, which keeps tests free to
//! substitute in-memory fakes.

mod api_keys;
mod servers;
mod traffic;

pub use api_keys::SqlApiKeyRepository;
pub use servers::SqlServerRepository;
pub use traffic::SqlTrafficLogRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{ApiKey, ManagedMcpServer, NewTrafficLog};
use crate::error::StorageResult;

/// Access to API key rows
#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// All keys that are neither revoked nor expired
    async fn list_active(&self) -> StorageResult<Vec<ApiKey>>;

    /// Persist a freshly issued key
    async fn create(&self, key: &ApiKey) -> StorageResult<()>;

    /// Record key usage
    async fn touch_last_used(&self, id: &str, at: DateTime<Utc>) -> StorageResult<()>;
}

/// Access to managed upstream rows
#[async_trait]
pub trait ServerRepository: Send + Sync {
    /// Every enabled upstream
    async fn list_enabled(&self) -> StorageResult<Vec<ManagedMcpServer>>;

    /// One upstream by id
    async fn find_by_id(&self, id: &str) -> StorageResult<Option<ManagedMcpServer>>;

    /// Mirror connector status into the row
    async fn update_status(
        &self,
        id: &str,
        status: &str,
        last_error: Option<&str>,
    ) -> StorageResult<()>;
}

/// Append-only traffic log sink
#[async_trait]
pub trait TrafficLogRepository: Send + Sync {
    /// Insert one row
    async fn insert(&self, record: NewTrafficLog) -> StorageResult<()>;
}
