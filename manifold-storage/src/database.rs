//! Connection pool and schema management

use manifold_config::DatabaseConfig;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::error::{StorageError, StorageResult};

/// Schema statements applied at startup
///
/// Additive and idempotent; there is no migration history table.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS api_key (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        hashed_api_key TEXT NOT NULL UNIQUE,
        salt TEXT NOT NULL,
        prefix TEXT NOT NULL,
        scopes TEXT,
        expires_at TEXT,
        last_used_at TEXT,
        revoked_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS managed_mcp_server (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        server_type TEXT NOT NULL,
        connection_details TEXT NOT NULL,
        mcp_options TEXT,
        status TEXT NOT NULL DEFAULT 'stopped',
        is_enabled INTEGER NOT NULL DEFAULT 1,
        tags TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_pinged_at TEXT,
        last_error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS traffic_log (
        id TEXT PRIMARY KEY,
        server_id TEXT REFERENCES managed_mcp_server(id),
        timestamp TEXT NOT NULL,
        mcp_method TEXT,
        mcp_request_id TEXT,
        source_ip TEXT,
        request_size_bytes INTEGER,
        response_size_bytes INTEGER,
        http_status INTEGER,
        target_server_http_status INTEGER,
        is_success INTEGER NOT NULL,
        duration_ms INTEGER,
        api_key_id TEXT REFERENCES api_key(id),
        error_message TEXT,
        session_id TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS server_extension_installation (
        id TEXT PRIMARY KEY,
        server_id TEXT NOT NULL REFERENCES managed_mcp_server(id),
        extension_id TEXT NOT NULL,
        installed_version TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mcp_marketplace_server (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        homepage_url TEXT,
        install_spec TEXT,
        tags TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_traffic_log_server ON traffic_log(server_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_traffic_log_api_key ON traffic_log(api_key_id, timestamp)",
];

/// Shared connection pool
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect using the database domain configuration
    pub async fn connect(config: &DatabaseConfig) -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await?;

        info!(url = %config.url, "connected to database");
        Ok(Self { pool })
    }

    /// Connect to an in-memory database (tests)
    pub async fn connect_in_memory() -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Apply the schema
    pub async fn migrate(&self) -> StorageResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    /// Access the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();

        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('api_key', 'managed_mcp_server', 'traffic_log', 'server_extension_installation', 'mcp_marketplace_server')")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(count.0, 5);
    }
}
