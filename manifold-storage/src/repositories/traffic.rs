//! Traffic log repository

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::database::Database;
use crate::entities::NewTrafficLog;
use crate::error::StorageResult;
use crate::repositories::TrafficLogRepository;

/// sqlx-backed traffic log sink
#[derive(Clone)]
pub struct SqlTrafficLogRepository {
    db: Database,
}

impl SqlTrafficLogRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TrafficLogRepository for SqlTrafficLogRepository {
    async fn insert(&self, record: NewTrafficLog) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO traffic_log
                (id, server_id, timestamp, mcp_method, mcp_request_id, source_ip,
                 request_size_bytes, response_size_bytes, http_status,
                 target_server_http_status, is_success, duration_ms,
                 api_key_id, error_message, session_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.server_id)
        .bind(Utc::now())
        .bind(&record.mcp_method)
        .bind(&record.mcp_request_id)
        .bind(&record.source_ip)
        .bind(record.request_size_bytes)
        .bind(record.response_size_bytes)
        .bind(record.http_status)
        .bind(record.target_server_http_status)
        .bind(record.is_success)
        .bind(record.duration_ms)
        .bind(&record.api_key_id)
        .bind(&record.error_message)
        .bind(&record.session_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}
