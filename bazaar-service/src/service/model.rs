use crate::model::{Model, ModelDetail, ModelPermissionsResponse, User};
use crate::repo::model::{ModelDeleteOutcome, ModelRepo};
use crate::repo::user::UserRepo;
use crate::repo::RepoError;
use crate::service::job::{
    deploy_job_name, model_prefix, train_job_name, JobLauncher, LaunchError,
};
use crate::service::permission::{PermissionError, PermissionService};
use bazaar_common::model::{DefaultPermission, ModelAccess, ModelId, ModelPermission};
use bazaar_common::SafeDisplay;
use bazaar_service_base::storage::{ByteStream, SharedStorage, StorageError};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ModelServiceError {
    #[error("model not found: {0}")]
    NotFound(ModelId),
    #[error("model has dependents")]
    HasDependents,
    #[error("a protected model requires a team")]
    ProtectedWithoutTeam,
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for ModelServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            ModelServiceError::Permission(inner) => inner.to_safe_string(),
            ModelServiceError::Launch(inner) => inner.to_safe_string(),
            ModelServiceError::Storage(inner) => inner.to_safe_string(),
            ModelServiceError::InternalRepoError(inner) => inner.to_safe_string(),
            _ => self.to_string(),
        }
    }
}

pub struct ModelService {
    model_repo: Arc<dyn ModelRepo>,
    user_repo: Arc<dyn UserRepo>,
    permissions: Arc<PermissionService>,
    storage: Arc<dyn SharedStorage>,
    launcher: Arc<JobLauncher>,
}

impl ModelService {
    pub fn new(
        model_repo: Arc<dyn ModelRepo>,
        user_repo: Arc<dyn UserRepo>,
        permissions: Arc<PermissionService>,
        storage: Arc<dyn SharedStorage>,
        launcher: Arc<JobLauncher>,
    ) -> Self {
        Self {
            model_repo,
            user_repo,
            permissions,
            storage,
            launcher,
        }
    }

    pub async fn get_detail(
        &self,
        user: &User,
        id: &ModelId,
    ) -> Result<ModelDetail, ModelServiceError> {
        self.permissions
            .require(user, id, ModelPermission::Read)
            .await?;
        self.model_repo
            .get_detail(id)
            .await?
            .ok_or(ModelServiceError::NotFound(*id))
    }

    pub async fn list(&self, user: &User) -> Result<Vec<Model>, ModelServiceError> {
        Ok(self
            .model_repo
            .list_visible(&user.id, user.is_admin)
            .await?)
    }

    pub async fn models_of_user(
        &self,
        user_id: &bazaar_common::model::UserId,
    ) -> Result<Vec<Model>, ModelServiceError> {
        Ok(self.model_repo.models_of_user(user_id).await?)
    }

    pub async fn delete(&self, user: &User, id: &ModelId) -> Result<(), ModelServiceError> {
        self.permissions
            .require(user, id, ModelPermission::Owner)
            .await?;
        self.purge(id).await
    }

    /// Deletes the row (refusing while dependents exist), stops any live
    /// jobs and removes the artifacts. Used by the delete endpoint after its
    /// permission check and by account deletion.
    pub async fn purge(&self, id: &ModelId) -> Result<(), ModelServiceError> {
        match self.model_repo.delete(id).await? {
            ModelDeleteOutcome::Deleted(model) => {
                self.launcher.stop_job(&train_job_name(&model.id)).await?;
                self.launcher.stop_job(&deploy_job_name(&model.id)).await?;
                self.storage.delete(&model_prefix(&model.id)).await?;
                self.storage.delete(&format!("logs/{}", model.id)).await?;
                info!(model_id = %id, "deleted model");
                Ok(())
            }
            ModelDeleteOutcome::HasDependents => Err(ModelServiceError::HasDependents),
            ModelDeleteOutcome::NotFound => Err(ModelServiceError::NotFound(*id)),
        }
    }

    pub async fn set_access(
        &self,
        user: &User,
        id: &ModelId,
        access: ModelAccess,
    ) -> Result<(), ModelServiceError> {
        let model = self
            .permissions
            .require(user, id, ModelPermission::Owner)
            .await?;
        if access == ModelAccess::Protected && model.team_id.is_none() {
            return Err(ModelServiceError::ProtectedWithoutTeam);
        }
        self.model_repo.set_access(id, access).await?;
        Ok(())
    }

    pub async fn set_default_permission(
        &self,
        user: &User,
        id: &ModelId,
        default_permission: DefaultPermission,
    ) -> Result<(), ModelServiceError> {
        self.permissions
            .require(user, id, ModelPermission::Owner)
            .await?;
        self.model_repo
            .set_default_permission(id, default_permission)
            .await?;
        Ok(())
    }

    /// Effective access summary for any authenticated caller; useful for
    /// UIs deciding which actions to offer.
    pub async fn permissions_view(
        &self,
        user: &User,
        id: &ModelId,
    ) -> Result<ModelPermissionsResponse, ModelServiceError> {
        let model = self
            .model_repo
            .get(id)
            .await?
            .ok_or(ModelServiceError::NotFound(*id))?;
        let caller_permission = self.permissions.permission_for(user, &model).await?;
        let owner_username = self
            .user_repo
            .get(&model.user_id)
            .await?
            .map(|owner| owner.username)
            .unwrap_or_default();
        Ok(ModelPermissionsResponse {
            access: model.access,
            default_permission: model.default_permission,
            owner_username,
            team_id: model.team_id,
            caller_permission,
        })
    }

    /// Zips the artifact subtree and streams the archive.
    pub async fn download(
        &self,
        user: &User,
        id: &ModelId,
    ) -> Result<(String, ByteStream), ModelServiceError> {
        self.permissions
            .require(user, id, ModelPermission::Read)
            .await?;
        let prefix = model_prefix(id);
        if !self.storage.exists(&prefix).await? {
            return Err(ModelServiceError::Storage(StorageError::NotFound(prefix)));
        }
        let archive = self.storage.zip(&prefix).await?;
        let stream = self.storage.read_stream(&archive).await?;
        Ok((format!("{id}.zip"), stream))
    }
}
