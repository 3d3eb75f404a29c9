use super::RepoError;
use crate::model::ApiKey;
use async_trait::async_trait;
use bazaar_common::model::{ApiKeyId, ModelId, UserId};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub secret_hash: String,
    pub name: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub all_models: bool,
}

impl From<ApiKeyRecord> for ApiKey {
    fn from(record: ApiKeyRecord) -> Self {
        ApiKey {
            id: ApiKeyId(record.id),
            name: record.name,
            user_id: UserId(record.user_id),
            expires_at: record.expires_at,
            all_models: record.all_models,
        }
    }
}

#[async_trait]
pub trait ApiKeyRepo: Send + Sync {
    async fn create(
        &self,
        record: &ApiKeyRecord,
        model_ids: &[ModelId],
    ) -> Result<(), RepoError>;

    /// Full record including the secret hash, for verification.
    async fn get(&self, id: &ApiKeyId) -> Result<Option<ApiKeyRecord>, RepoError>;

    async fn models_of(&self, id: &ApiKeyId) -> Result<Vec<ModelId>, RepoError>;

    async fn list_of_owner(&self, user_id: &UserId) -> Result<Vec<ApiKey>, RepoError>;

    async fn delete(&self, id: &ApiKeyId, owner: &UserId) -> Result<bool, RepoError>;
}

pub struct DbApiKeyRepo {
    db_pool: PgPool,
}

impl DbApiKeyRepo {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl ApiKeyRepo for DbApiKeyRepo {
    async fn create(&self, record: &ApiKeyRecord, model_ids: &[ModelId]) -> Result<(), RepoError> {
        let mut tx = self.db_pool.begin().await.map_err(RepoError::from)?;

        sqlx::query(
            r#"
              INSERT INTO api_keys (id, secret_hash, name, user_id, expires_at, all_models)
              VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(&record.secret_hash)
        .bind(&record.name)
        .bind(record.user_id)
        .bind(record.expires_at)
        .bind(record.all_models)
        .execute(&mut *tx)
        .await
        .map_err(RepoError::from)?;

        for model_id in model_ids {
            sqlx::query(
                r#"
                  INSERT INTO api_key_models (api_key_id, model_id)
                  VALUES ($1, $2)
                  ON CONFLICT DO NOTHING
                "#,
            )
            .bind(record.id)
            .bind(model_id.0)
            .execute(&mut *tx)
            .await
            .map_err(RepoError::from)?;
        }

        tx.commit().await.map_err(RepoError::from)?;
        Ok(())
    }

    async fn get(&self, id: &ApiKeyId) -> Result<Option<ApiKeyRecord>, RepoError> {
        sqlx::query_as::<_, ApiKeyRecord>(
            "SELECT id, secret_hash, name, user_id, expires_at, all_models FROM api_keys WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(RepoError::from)
    }

    async fn models_of(&self, id: &ApiKeyId) -> Result<Vec<ModelId>, RepoError> {
        let rows = sqlx::query("SELECT model_id FROM api_key_models WHERE api_key_id = $1")
            .bind(id.0)
            .fetch_all(&self.db_pool)
            .await
            .map_err(RepoError::from)?;
        Ok(rows
            .into_iter()
            .map(|row| ModelId(row.get("model_id")))
            .collect())
    }

    async fn list_of_owner(&self, user_id: &UserId) -> Result<Vec<ApiKey>, RepoError> {
        sqlx::query_as::<_, ApiKeyRecord>(
            r#"
              SELECT id, secret_hash, name, user_id, expires_at, all_models
              FROM api_keys WHERE user_id = $1 ORDER BY name
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&self.db_pool)
        .await
        .map(|records| records.into_iter().map(ApiKey::from).collect())
        .map_err(RepoError::from)
    }

    async fn delete(&self, id: &ApiKeyId, owner: &UserId) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = $1 AND user_id = $2")
            .bind(id.0)
            .bind(owner.0)
            .execute(&self.db_pool)
            .await
            .map_err(RepoError::from)?;
        Ok(result.rows_affected() > 0)
    }
}
