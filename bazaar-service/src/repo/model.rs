use super::{decode_error, RepoError, TransitionOutcome};
use crate::model::{JobLogEntry, Model, ModelDetail};
use async_trait::async_trait;
use bazaar_common::model::{
    DefaultPermission, DeployStatus, JobLogLevel, ModelAccess, ModelId, ModelType, TeamId,
    TrainStatus, UserId,
};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ModelRecord {
    pub id: Uuid,
    pub name: String,
    pub model_type: String,
    pub published_date: DateTime<Utc>,
    pub train_status: String,
    pub deploy_status: String,
    pub access: String,
    pub default_permission: String,
    pub deployment_name: Option<String>,
    pub base_model_id: Option<Uuid>,
    pub user_id: Uuid,
    pub team_id: Option<Uuid>,
}

impl TryFrom<ModelRecord> for Model {
    type Error = String;

    fn try_from(record: ModelRecord) -> Result<Self, Self::Error> {
        Ok(Model {
            id: ModelId(record.id),
            name: record.name,
            model_type: record.model_type.parse::<ModelType>()?,
            published_date: record.published_date,
            train_status: record.train_status.parse::<TrainStatus>()?,
            deploy_status: record.deploy_status.parse::<DeployStatus>()?,
            access: record.access.parse::<ModelAccess>()?,
            default_permission: record.default_permission.parse::<DefaultPermission>()?,
            deployment_name: record.deployment_name,
            base_model_id: record.base_model_id.map(ModelId),
            user_id: UserId(record.user_id),
            team_id: record.team_id.map(TeamId),
        })
    }
}

impl From<&Model> for ModelRecord {
    fn from(model: &Model) -> Self {
        ModelRecord {
            id: model.id.0,
            name: model.name.clone(),
            model_type: model.model_type.to_string(),
            published_date: model.published_date,
            train_status: model.train_status.to_string(),
            deploy_status: model.deploy_status.to_string(),
            access: model.access.to_string(),
            default_permission: model.default_permission.to_string(),
            deployment_name: model.deployment_name.clone(),
            base_model_id: model.base_model_id.map(|id| id.0),
            user_id: model.user_id.0,
            team_id: model.team_id.map(|id| id.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelDeleteOutcome {
    Deleted(Box<Model>),
    /// Another model lists this one as a dependency.
    HasDependents,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddDependencyOutcome {
    Added,
    /// The edge would close a cycle in the dependency graph.
    WouldCycle,
    NotFound,
}

const MODEL_COLUMNS: &str = "id, name, model_type, published_date, train_status, deploy_status, \
     access, default_permission, deployment_name, base_model_id, user_id, team_id";

fn to_model(record: ModelRecord) -> Result<Model, RepoError> {
    Model::try_from(record).map_err(decode_error)
}

fn to_models(records: Vec<ModelRecord>) -> Result<Vec<Model>, RepoError> {
    records.into_iter().map(to_model).collect()
}

#[async_trait]
pub trait ModelRepo: Send + Sync {
    async fn create(&self, model: &Model) -> Result<(), RepoError>;

    async fn get(&self, id: &ModelId) -> Result<Option<Model>, RepoError>;

    async fn get_by_owner_and_name(
        &self,
        user_id: &UserId,
        name: &str,
    ) -> Result<Option<Model>, RepoError>;

    /// Model with attributes, dependencies and the owner's username
    /// preloaded.
    async fn get_detail(&self, id: &ModelId) -> Result<Option<ModelDetail>, RepoError>;

    async fn list_visible(&self, user_id: &UserId, is_admin: bool) -> Result<Vec<Model>, RepoError>;

    async fn delete(&self, id: &ModelId) -> Result<ModelDeleteOutcome, RepoError>;

    async fn models_of_user(&self, user_id: &UserId) -> Result<Vec<Model>, RepoError>;

    async fn set_access(&self, id: &ModelId, access: ModelAccess) -> Result<bool, RepoError>;

    async fn set_default_permission(
        &self,
        id: &ModelId,
        default_permission: DefaultPermission,
    ) -> Result<bool, RepoError>;

    /// Assigning `None` also downgrades protected models to private so no
    /// protected model is left without a team.
    async fn set_team(&self, id: &ModelId, team_id: Option<TeamId>) -> Result<bool, RepoError>;

    async fn set_deployment_name(&self, id: &ModelId, name: &str) -> Result<bool, RepoError>;

    async fn transition_train(
        &self,
        id: &ModelId,
        next: TrainStatus,
    ) -> Result<TransitionOutcome<TrainStatus>, RepoError>;

    async fn transition_deploy(
        &self,
        id: &ModelId,
        next: DeployStatus,
    ) -> Result<TransitionOutcome<DeployStatus>, RepoError>;

    /// Inserts a dependency edge after walking the transitive closure of the
    /// dependency inside the same transaction; refuses edges that would close
    /// a cycle.
    async fn add_dependency(
        &self,
        model_id: &ModelId,
        dependency_id: &ModelId,
    ) -> Result<AddDependencyOutcome, RepoError>;

    async fn dependencies_of(&self, id: &ModelId) -> Result<Vec<Model>, RepoError>;

    async fn upsert_attribute(
        &self,
        id: &ModelId,
        key: &str,
        value: &str,
    ) -> Result<(), RepoError>;

    async fn attributes(&self, id: &ModelId) -> Result<BTreeMap<String, String>, RepoError>;

    async fn append_job_log(
        &self,
        id: &ModelId,
        level: JobLogLevel,
        message: &str,
    ) -> Result<(), RepoError>;

    async fn job_logs(&self, id: &ModelId) -> Result<Vec<JobLogEntry>, RepoError>;

    /// Models with a live training or deployment the reconciler must watch.
    async fn non_terminal(&self) -> Result<Vec<Model>, RepoError>;
}

pub struct DbModelRepo {
    db_pool: PgPool,
}

impl DbModelRepo {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl ModelRepo for DbModelRepo {
    async fn create(&self, model: &Model) -> Result<(), RepoError> {
        let record = ModelRecord::from(model);
        sqlx::query(
            r#"
              INSERT INTO models
                (id, name, model_type, published_date, train_status, deploy_status,
                 access, default_permission, deployment_name, base_model_id, user_id, team_id)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.model_type)
        .bind(record.published_date)
        .bind(&record.train_status)
        .bind(&record.deploy_status)
        .bind(&record.access)
        .bind(&record.default_permission)
        .bind(&record.deployment_name)
        .bind(record.base_model_id)
        .bind(record.user_id)
        .bind(record.team_id)
        .execute(&self.db_pool)
        .await
        .map_err(RepoError::from)?;
        Ok(())
    }

    async fn get(&self, id: &ModelId) -> Result<Option<Model>, RepoError> {
        sqlx::query_as::<_, ModelRecord>(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(RepoError::from)?
        .map(to_model)
        .transpose()
    }

    async fn get_by_owner_and_name(
        &self,
        user_id: &UserId,
        name: &str,
    ) -> Result<Option<Model>, RepoError> {
        sqlx::query_as::<_, ModelRecord>(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE user_id = $1 AND name = $2"
        ))
        .bind(user_id.0)
        .bind(name)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(RepoError::from)?
        .map(to_model)
        .transpose()
    }

    async fn get_detail(&self, id: &ModelId) -> Result<Option<ModelDetail>, RepoError> {
        let Some(model) = self.get(id).await? else {
            return Ok(None);
        };

        let owner_username: String =
            sqlx::query_scalar("SELECT username FROM users WHERE id = $1")
                .bind(model.user_id.0)
                .fetch_one(&self.db_pool)
                .await
                .map_err(RepoError::from)?;

        let attributes = self.attributes(id).await?;
        let dependencies = self.dependencies_of(id).await?;

        Ok(Some(ModelDetail {
            model,
            owner_username,
            attributes,
            dependencies,
        }))
    }

    async fn list_visible(&self, user_id: &UserId, is_admin: bool) -> Result<Vec<Model>, RepoError> {
        let records = if is_admin {
            sqlx::query_as::<_, ModelRecord>(&format!(
                "SELECT {MODEL_COLUMNS} FROM models ORDER BY published_date DESC"
            ))
            .fetch_all(&self.db_pool)
            .await
        } else {
            sqlx::query_as::<_, ModelRecord>(&format!(
                r#"
                  SELECT {MODEL_COLUMNS} FROM models
                  WHERE user_id = $1
                     OR access = 'public'
                     OR (access = 'protected'
                         AND team_id IN (SELECT team_id FROM user_teams WHERE user_id = $1))
                  ORDER BY published_date DESC
                "#
            ))
            .bind(user_id.0)
            .fetch_all(&self.db_pool)
            .await
        }
        .map_err(RepoError::from)?;
        to_models(records)
    }

    async fn delete(&self, id: &ModelId) -> Result<ModelDeleteOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await.map_err(RepoError::from)?;

        let record = sqlx::query_as::<_, ModelRecord>(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(RepoError::from)?;
        let Some(record) = record else {
            return Ok(ModelDeleteOutcome::NotFound);
        };

        let dependent =
            sqlx::query("SELECT 1 FROM model_dependencies WHERE dependency_id = $1 LIMIT 1")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(RepoError::from)?;
        if dependent.is_some() {
            return Ok(ModelDeleteOutcome::HasDependents);
        }

        sqlx::query("DELETE FROM models WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(RepoError::from)?;
        tx.commit().await.map_err(RepoError::from)?;
        Ok(ModelDeleteOutcome::Deleted(Box::new(to_model(record)?)))
    }

    async fn models_of_user(&self, user_id: &UserId) -> Result<Vec<Model>, RepoError> {
        let records = sqlx::query_as::<_, ModelRecord>(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE user_id = $1"
        ))
        .bind(user_id.0)
        .fetch_all(&self.db_pool)
        .await
        .map_err(RepoError::from)?;
        to_models(records)
    }

    async fn set_access(&self, id: &ModelId, access: ModelAccess) -> Result<bool, RepoError> {
        let result = sqlx::query("UPDATE models SET access = $2 WHERE id = $1")
            .bind(id.0)
            .bind(access.to_string())
            .execute(&self.db_pool)
            .await
            .map_err(RepoError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_default_permission(
        &self,
        id: &ModelId,
        default_permission: DefaultPermission,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query("UPDATE models SET default_permission = $2 WHERE id = $1")
            .bind(id.0)
            .bind(default_permission.to_string())
            .execute(&self.db_pool)
            .await
            .map_err(RepoError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_team(&self, id: &ModelId, team_id: Option<TeamId>) -> Result<bool, RepoError> {
        let result = match team_id {
            Some(team_id) => sqlx::query("UPDATE models SET team_id = $2 WHERE id = $1")
                .bind(id.0)
                .bind(team_id.0)
                .execute(&self.db_pool)
                .await
                .map_err(RepoError::from)?,
            None => sqlx::query(
                r#"
                  UPDATE models
                  SET team_id = NULL,
                      access = CASE WHEN access = 'protected' THEN 'private' ELSE access END
                  WHERE id = $1
                "#,
            )
            .bind(id.0)
            .execute(&self.db_pool)
            .await
            .map_err(RepoError::from)?,
        };
        Ok(result.rows_affected() > 0)
    }

    async fn set_deployment_name(&self, id: &ModelId, name: &str) -> Result<bool, RepoError> {
        let result = sqlx::query("UPDATE models SET deployment_name = $2 WHERE id = $1")
            .bind(id.0)
            .bind(name)
            .execute(&self.db_pool)
            .await
            .map_err(RepoError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_train(
        &self,
        id: &ModelId,
        next: TrainStatus,
    ) -> Result<TransitionOutcome<TrainStatus>, RepoError> {
        let mut tx = self.db_pool.begin().await.map_err(RepoError::from)?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT train_status FROM models WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(RepoError::from)?;
        let Some(current) = current else {
            return Ok(TransitionOutcome::NotFound);
        };
        let current = current.parse::<TrainStatus>().map_err(decode_error)?;

        if current == next {
            return Ok(TransitionOutcome::Unchanged);
        }
        if !current.may_transition(next) {
            return Ok(TransitionOutcome::Refused { current });
        }

        sqlx::query("UPDATE models SET train_status = $2 WHERE id = $1")
            .bind(id.0)
            .bind(next.to_string())
            .execute(&mut *tx)
            .await
            .map_err(RepoError::from)?;
        tx.commit().await.map_err(RepoError::from)?;
        Ok(TransitionOutcome::Applied { from: current })
    }

    async fn transition_deploy(
        &self,
        id: &ModelId,
        next: DeployStatus,
    ) -> Result<TransitionOutcome<DeployStatus>, RepoError> {
        let mut tx = self.db_pool.begin().await.map_err(RepoError::from)?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT deploy_status FROM models WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(RepoError::from)?;
        let Some(current) = current else {
            return Ok(TransitionOutcome::NotFound);
        };
        let current = current.parse::<DeployStatus>().map_err(decode_error)?;

        if current == next {
            return Ok(TransitionOutcome::Unchanged);
        }
        if !current.may_transition(next) {
            return Ok(TransitionOutcome::Refused { current });
        }

        sqlx::query("UPDATE models SET deploy_status = $2 WHERE id = $1")
            .bind(id.0)
            .bind(next.to_string())
            .execute(&mut *tx)
            .await
            .map_err(RepoError::from)?;
        tx.commit().await.map_err(RepoError::from)?;
        Ok(TransitionOutcome::Applied { from: current })
    }

    async fn add_dependency(
        &self,
        model_id: &ModelId,
        dependency_id: &ModelId,
    ) -> Result<AddDependencyOutcome, RepoError> {
        if model_id == dependency_id {
            return Ok(AddDependencyOutcome::WouldCycle);
        }

        let mut tx = self.db_pool.begin().await.map_err(RepoError::from)?;

        let locked = sqlx::query("SELECT id FROM models WHERE id = ANY($1) FOR UPDATE")
            .bind(vec![model_id.0, dependency_id.0])
            .fetch_all(&mut *tx)
            .await
            .map_err(RepoError::from)?;
        if locked.len() != 2 {
            return Ok(AddDependencyOutcome::NotFound);
        }

        // the new edge closes a cycle iff model_id is reachable from
        // dependency_id
        let cycle = sqlx::query(
            r#"
              WITH RECURSIVE closure AS (
                SELECT dependency_id FROM model_dependencies WHERE model_id = $1
                UNION
                SELECT md.dependency_id
                FROM model_dependencies md
                JOIN closure c ON md.model_id = c.dependency_id
              )
              SELECT 1 FROM closure WHERE dependency_id = $2 LIMIT 1
            "#,
        )
        .bind(dependency_id.0)
        .bind(model_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(RepoError::from)?;
        if cycle.is_some() {
            return Ok(AddDependencyOutcome::WouldCycle);
        }

        sqlx::query(
            r#"
              INSERT INTO model_dependencies (model_id, dependency_id)
              VALUES ($1, $2)
              ON CONFLICT DO NOTHING
            "#,
        )
        .bind(model_id.0)
        .bind(dependency_id.0)
        .execute(&mut *tx)
        .await
        .map_err(RepoError::from)?;
        tx.commit().await.map_err(RepoError::from)?;
        Ok(AddDependencyOutcome::Added)
    }

    async fn dependencies_of(&self, id: &ModelId) -> Result<Vec<Model>, RepoError> {
        let records = sqlx::query_as::<_, ModelRecord>(&format!(
            r#"
              SELECT {MODEL_COLUMNS} FROM models
              WHERE id IN (SELECT dependency_id FROM model_dependencies WHERE model_id = $1)
            "#
        ))
        .bind(id.0)
        .fetch_all(&self.db_pool)
        .await
        .map_err(RepoError::from)?;
        to_models(records)
    }

    async fn upsert_attribute(
        &self,
        id: &ModelId,
        key: &str,
        value: &str,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO model_attributes (model_id, key, value)
              VALUES ($1, $2, $3)
              ON CONFLICT (model_id, key) DO UPDATE SET value = $3
            "#,
        )
        .bind(id.0)
        .bind(key)
        .bind(value)
        .execute(&self.db_pool)
        .await
        .map_err(RepoError::from)?;
        Ok(())
    }

    async fn attributes(&self, id: &ModelId) -> Result<BTreeMap<String, String>, RepoError> {
        let rows = sqlx::query("SELECT key, value FROM model_attributes WHERE model_id = $1")
            .bind(id.0)
            .fetch_all(&self.db_pool)
            .await
            .map_err(RepoError::from)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("key"), row.get::<String, _>("value")))
            .collect())
    }

    async fn append_job_log(
        &self,
        id: &ModelId,
        level: JobLogLevel,
        message: &str,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO job_logs (model_id, level, logged_at, message) VALUES ($1, $2, $3, $4)",
        )
        .bind(id.0)
        .bind(level.to_string())
        .bind(Utc::now())
        .bind(message)
        .execute(&self.db_pool)
        .await
        .map_err(RepoError::from)?;
        Ok(())
    }

    async fn job_logs(&self, id: &ModelId) -> Result<Vec<JobLogEntry>, RepoError> {
        let rows = sqlx::query(
            "SELECT model_id, level, logged_at, message FROM job_logs WHERE model_id = $1 ORDER BY id",
        )
        .bind(id.0)
        .fetch_all(&self.db_pool)
        .await
        .map_err(RepoError::from)?;
        rows.into_iter()
            .map(|row| {
                Ok(JobLogEntry {
                    model_id: ModelId(row.get("model_id")),
                    level: row
                        .get::<String, _>("level")
                        .parse::<JobLogLevel>()
                        .map_err(decode_error)?,
                    logged_at: row.get("logged_at"),
                    message: row.get("message"),
                })
            })
            .collect()
    }

    async fn non_terminal(&self) -> Result<Vec<Model>, RepoError> {
        let records = sqlx::query_as::<_, ModelRecord>(&format!(
            r#"
              SELECT {MODEL_COLUMNS} FROM models
              WHERE train_status IN ('starting', 'in_progress')
                 OR deploy_status IN ('starting', 'in_progress', 'complete')
            "#
        ))
        .fetch_all(&self.db_pool)
        .await
        .map_err(RepoError::from)?;
        to_models(records)
    }
}
