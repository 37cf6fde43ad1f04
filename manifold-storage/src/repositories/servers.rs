//! Managed upstream repository

use async_trait::async_trait;
use chrono::Utc;

use crate::database::Database;
use crate::entities::ManagedMcpServer;
use crate::error::StorageResult;
use crate::repositories::ServerRepository;

/// sqlx-backed upstream repository
#[derive(Clone)]
pub struct SqlServerRepository {
    db: Database,
}

impl SqlServerRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a row; used by tests and bootstrap tooling
    pub async fn create(&self, server: &ManagedMcpServer) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO managed_mcp_server
                (id, name, description, server_type, connection_details, mcp_options,
                 status, is_enabled, tags, created_at, updated_at, last_pinged_at, last_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&server.id)
        .bind(&server.name)
        .bind(&server.description)
        .bind(&server.server_type)
        .bind(&server.connection_details)
        .bind(&server.mcp_options)
        .bind(&server.status)
        .bind(server.is_enabled)
        .bind(&server.tags)
        .bind(server.created_at)
        .bind(server.updated_at)
        .bind(server.last_pinged_at)
        .bind(&server.last_error)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, name, description, server_type, connection_details, mcp_options,
           status, is_enabled, tags, created_at, updated_at, last_pinged_at, last_error
    FROM managed_mcp_server
"#;

#[async_trait]
impl ServerRepository for SqlServerRepository {
    async fn list_enabled(&self) -> StorageResult<Vec<ManagedMcpServer>> {
        let servers = sqlx::query_as::<_, ManagedMcpServer>(&format!(
            "{} WHERE is_enabled = 1 ORDER BY created_at",
            SELECT_COLUMNS
        ))
        .fetch_all(self.db.pool())
        .await?;
        Ok(servers)
    }

    async fn find_by_id(&self, id: &str) -> StorageResult<Option<ManagedMcpServer>> {
        let server = sqlx::query_as::<_, ManagedMcpServer>(&format!(
            "{} WHERE id = ?1",
            SELECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(server)
    }

    async fn update_status(
        &self,
        id: &str,
        status: &str,
        last_error: Option<&str>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE managed_mcp_server
            SET status = ?1, last_error = ?2, last_pinged_at = ?3, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(status)
        .bind(last_error)
        .bind(Utc::now())
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_server(id: &str, enabled: bool) -> ManagedMcpServer {
        let now = Utc::now();
        ManagedMcpServer {
            id: id.to_string(),
            name: format!("server {}", id),
            description: None,
            server_type: "stdio".to_string(),
            connection_details: r#"{"type":"stdio","command":"echo-server"}"#.to_string(),
            mcp_options: None,
            status: "stopped".to_string(),
            is_enabled: enabled,
            tags: None,
            created_at: now,
            updated_at: now,
            last_pinged_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_list_enabled_skips_disabled() {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let repo = SqlServerRepository::new(db);

        repo.create(&make_server("on", true)).await.unwrap();
        repo.create(&make_server("off", false)).await.unwrap();

        let enabled = repo.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "on");
    }

    #[tokio::test]
    async fn test_update_status() {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let repo = SqlServerRepository::new(db);

        repo.create(&make_server("u", true)).await.unwrap();
        repo.update_status("u", "running", None).await.unwrap();

        let server = repo.find_by_id("u").await.unwrap().unwrap();
        assert_eq!(server.status, "running");
        assert!(server.last_pinged_at.is_some());

        repo.update_status("u", "error", Some("handshake failed"))
            .await
            .unwrap();
        let server = repo.find_by_id("u").await.unwrap().unwrap();
        assert_eq!(server.last_error.as_deref(), Some("handshake failed"));
    }
}
