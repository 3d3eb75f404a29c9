use super::RepoError;
use crate::model::UploadSession;
use async_trait::async_trait;
use bazaar_common::model::{UploadId, UserId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct UploadRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub model_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<UploadRecord> for UploadSession {
    fn from(record: UploadRecord) -> Self {
        UploadSession {
            id: UploadId(record.id),
            user_id: UserId(record.user_id),
            model_name: record.model_name,
            created_at: record.created_at,
        }
    }
}

#[async_trait]
pub trait UploadRepo: Send + Sync {
    async fn create(&self, session: &UploadSession) -> Result<(), RepoError>;

    async fn get(&self, id: &UploadId) -> Result<Option<UploadSession>, RepoError>;

    async fn delete(&self, id: &UploadId) -> Result<bool, RepoError>;

    /// Sessions abandoned before the cutoff, for the janitor.
    async fn created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<UploadSession>, RepoError>;
}

pub struct DbUploadRepo {
    db_pool: PgPool,
}

impl DbUploadRepo {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl UploadRepo for DbUploadRepo {
    async fn create(&self, session: &UploadSession) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO uploads (id, user_id, model_name, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(session.id.0)
        .bind(session.user_id.0)
        .bind(&session.model_name)
        .bind(session.created_at)
        .execute(&self.db_pool)
        .await
        .map_err(RepoError::from)?;
        Ok(())
    }

    async fn get(&self, id: &UploadId) -> Result<Option<UploadSession>, RepoError> {
        sqlx::query_as::<_, UploadRecord>(
            "SELECT id, user_id, model_name, created_at FROM uploads WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.db_pool)
        .await
        .map(|record| record.map(UploadSession::from))
        .map_err(RepoError::from)
    }

    async fn delete(&self, id: &UploadId) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM uploads WHERE id = $1")
            .bind(id.0)
            .execute(&self.db_pool)
            .await
            .map_err(RepoError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<UploadSession>, RepoError> {
        sqlx::query_as::<_, UploadRecord>(
            "SELECT id, user_id, model_name, created_at FROM uploads WHERE created_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.db_pool)
        .await
        .map(|records| records.into_iter().map(UploadSession::from).collect())
        .map_err(RepoError::from)
    }
}
