//! API key repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::database::Database;
use crate::entities::ApiKey;
use crate::error::StorageResult;
use crate::repositories::ApiKeyRepository;

/// sqlx-backed API key repository
#[derive(Clone)]
pub struct SqlApiKeyRepository {
    db: Database,
}

impl SqlApiKeyRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ApiKeyRepository for SqlApiKeyRepository {
    async fn list_active(&self) -> StorageResult<Vec<ApiKey>> {
        let keys = sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT id, name, hashed_api_key, salt, prefix, scopes,
                   expires_at, last_used_at, revoked_at, created_at, updated_at
            FROM api_key
            WHERE revoked_at IS NULL
              AND (expires_at IS NULL OR expires_at > ?1)
            "#,
        )
        .bind(Utc::now())
        .fetch_all(self.db.pool())
        .await?;
        Ok(keys)
    }

    async fn create(&self, key: &ApiKey) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO api_key
                (id, name, hashed_api_key, salt, prefix, scopes,
                 expires_at, last_used_at, revoked_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&key.id)
        .bind(&key.name)
        .bind(&key.hashed_api_key)
        .bind(&key.salt)
        .bind(&key.prefix)
        .bind(&key.scopes)
        .bind(key.expires_at)
        .bind(key.last_used_at)
        .bind(key.revoked_at)
        .bind(key.created_at)
        .bind(key.updated_at)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn touch_last_used(&self, id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE api_key SET last_used_at = ?1, updated_at = ?1 WHERE id = ?2")
            .bind(at)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_key(id: &str, revoked: bool, expired: bool) -> ApiKey {
        let now = Utc::now();
        ApiKey {
            id: id.to_string(),
            name: format!("key {}", id),
            hashed_api_key: format!("hash-{}", id),
            salt: "ab".to_string(),
            prefix: "mfk_test".to_string(),
            scopes: None,
            expires_at: expired.then(|| now - Duration::hours(1)),
            last_used_at: None,
            revoked_at: revoked.then(|| now),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_list_active_filters_revoked_and_expired() {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let repo = SqlApiKeyRepository::new(db);

        repo.create(&make_key("live", false, false)).await.unwrap();
        repo.create(&make_key("revoked", true, false)).await.unwrap();
        repo.create(&make_key("expired", false, true)).await.unwrap();

        let active = repo.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "live");
    }

    #[tokio::test]
    async fn test_touch_last_used() {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let repo = SqlApiKeyRepository::new(db);

        repo.create(&make_key("k", false, false)).await.unwrap();
        let at = Utc::now();
        repo.touch_last_used("k", at).await.unwrap();

        let keys = repo.list_active().await.unwrap();
        assert!(keys[0].last_used_at.is_some());
    }
}
