//! Persistence layer for the Manifold gateway
//!
//! Plain sqlx over the `DATABASE_URL` connection string. Only the rows the
//! gateway core reads and writes get repositories: API keys, managed upstream
//! records, and traffic logs. The remaining tables exist in the schema for
//! the administrative surface to use.

pub mod database;
pub mod entities;
pub mod error;
pub mod repositories;

pub use database::Database;
pub use entities::{ApiKey, ManagedMcpServer, NewTrafficLog, TrafficLog};
pub use error::{StorageError, StorageResult};
pub use repositories::{
    ApiKeyRepository, ServerRepository, SqlApiKeyRepository, SqlServerRepository,
    SqlTrafficLogRepository, TrafficLogRepository,
};
