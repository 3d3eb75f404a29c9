use super::RepoError;
use crate::model::User;
use async_trait::async_trait;
use bazaar_common::model::UserId;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub is_admin: bool,
    pub is_verified: bool,
}

impl From<UserRecord> for User {
    fn from(record: UserRecord) -> Self {
        User {
            id: UserId(record.id),
            username: record.username,
            email: record.email,
            password_hash: record.password_hash,
            is_admin: record.is_admin,
            is_verified: record.is_verified,
        }
    }
}

impl From<&User> for UserRecord {
    fn from(user: &User) -> Self {
        UserRecord {
            id: user.id.0,
            username: user.username.clone(),
            email: user.email.clone(),
            password_hash: user.password_hash.clone(),
            is_admin: user.is_admin,
            is_verified: user.is_verified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserDeleteOutcome {
    Deleted,
    /// Deleting this user would leave the platform without an admin.
    LastAdmin,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminFlagOutcome {
    Updated,
    LastAdmin,
    NotFound,
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn create(&self, user: &User) -> Result<(), RepoError>;

    async fn get(&self, id: &UserId) -> Result<Option<User>, RepoError>;

    async fn get_by_username(&self, username: &str) -> Result<Option<User>, RepoError>;

    async fn get_by_email(&self, email: &str) -> Result<Option<User>, RepoError>;

    async fn list(&self) -> Result<Vec<User>, RepoError>;

    /// Refuses to remove the last admin; the check and the delete run in one
    /// transaction holding locks on the admin rows.
    async fn delete(&self, id: &UserId) -> Result<UserDeleteOutcome, RepoError>;

    async fn set_admin(&self, id: &UserId, is_admin: bool) -> Result<AdminFlagOutcome, RepoError>;

    async fn set_verified(&self, id: &UserId, is_verified: bool) -> Result<bool, RepoError>;
}

pub struct DbUserRepo {
    db_pool: PgPool,
}

impl DbUserRepo {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

const USER_COLUMNS: &str = "id, username, email, password_hash, is_admin, is_verified";

#[async_trait]
impl UserRepo for DbUserRepo {
    async fn create(&self, user: &User) -> Result<(), RepoError> {
        let record = UserRecord::from(user);
        sqlx::query(
            r#"
              INSERT INTO users (id, username, email, password_hash, is_admin, is_verified)
              VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(&record.username)
        .bind(&record.email)
        .bind(&record.password_hash)
        .bind(record.is_admin)
        .bind(record.is_verified)
        .execute(&self.db_pool)
        .await
        .map_err(RepoError::from)?;
        Ok(())
    }

    async fn get(&self, id: &UserId) -> Result<Option<User>, RepoError> {
        sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.db_pool)
        .await
        .map(|record| record.map(User::from))
        .map_err(RepoError::from)
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>, RepoError> {
        sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(&self.db_pool)
        .await
        .map(|record| record.map(User::from))
        .map_err(RepoError::from)
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>, RepoError> {
        sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db_pool)
        .await
        .map(|record| record.map(User::from))
        .map_err(RepoError::from)
    }

    async fn list(&self) -> Result<Vec<User>, RepoError> {
        sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY username"
        ))
        .fetch_all(&self.db_pool)
        .await
        .map(|records| records.into_iter().map(User::from).collect())
        .map_err(RepoError::from)
    }

    async fn delete(&self, id: &UserId) -> Result<UserDeleteOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await.map_err(RepoError::from)?;

        let target = sqlx::query("SELECT is_admin FROM users WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(RepoError::from)?;
        let Some(target) = target else {
            return Ok(UserDeleteOutcome::NotFound);
        };

        if target.get::<bool, _>("is_admin") {
            let admins = sqlx::query("SELECT id FROM users WHERE is_admin = true FOR UPDATE")
                .fetch_all(&mut *tx)
                .await
                .map_err(RepoError::from)?;
            if admins.len() <= 1 {
                return Ok(UserDeleteOutcome::LastAdmin);
            }
        }

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(RepoError::from)?;
        tx.commit().await.map_err(RepoError::from)?;
        Ok(UserDeleteOutcome::Deleted)
    }

    async fn set_admin(&self, id: &UserId, is_admin: bool) -> Result<AdminFlagOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await.map_err(RepoError::from)?;

        let target = sqlx::query("SELECT is_admin FROM users WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(RepoError::from)?;
        let Some(target) = target else {
            return Ok(AdminFlagOutcome::NotFound);
        };

        if target.get::<bool, _>("is_admin") && !is_admin {
            let admins = sqlx::query("SELECT id FROM users WHERE is_admin = true FOR UPDATE")
                .fetch_all(&mut *tx)
                .await
                .map_err(RepoError::from)?;
            if admins.len() <= 1 {
                return Ok(AdminFlagOutcome::LastAdmin);
            }
        }

        sqlx::query("UPDATE users SET is_admin = $2 WHERE id = $1")
            .bind(id.0)
            .bind(is_admin)
            .execute(&mut *tx)
            .await
            .map_err(RepoError::from)?;
        tx.commit().await.map_err(RepoError::from)?;
        Ok(AdminFlagOutcome::Updated)
    }

    async fn set_verified(&self, id: &UserId, is_verified: bool) -> Result<bool, RepoError> {
        let result = sqlx::query("UPDATE users SET is_verified = $2 WHERE id = $1")
            .bind(id.0)
            .bind(is_verified)
            .execute(&self.db_pool)
            .await
            .map_err(RepoError::from)?;
        Ok(result.rows_affected() > 0)
    }
}
