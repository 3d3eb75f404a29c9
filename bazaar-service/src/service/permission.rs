use crate::model::{Model, User};
use crate::repo::model::ModelRepo;
use crate::repo::team::TeamRepo;
use crate::repo::RepoError;
use bazaar_common::model::{
    resolve_model_permission, ModelAccess, ModelId, ModelPermission, TeamMembership,
};
use bazaar_common::SafeDisplay;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("model not found: {0}")]
    ModelNotFound(ModelId),
    #[error("insufficient permission on model {model_id}: {required} required")]
    Denied {
        model_id: ModelId,
        required: ModelPermission,
    },
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for PermissionError {
    fn to_safe_string(&self) -> String {
        match self {
            PermissionError::InternalRepoError(inner) => inner.to_safe_string(),
            _ => self.to_string(),
        }
    }
}

/// Resolves the permission lattice against live team membership.
pub struct PermissionService {
    model_repo: Arc<dyn ModelRepo>,
    team_repo: Arc<dyn TeamRepo>,
}

impl PermissionService {
    pub fn new(model_repo: Arc<dyn ModelRepo>, team_repo: Arc<dyn TeamRepo>) -> Self {
        Self {
            model_repo,
            team_repo,
        }
    }

    pub async fn permission_for(
        &self,
        user: &User,
        model: &Model,
    ) -> Result<ModelPermission, PermissionError> {
        let membership = match (model.access, model.team_id) {
            (ModelAccess::Protected, Some(team_id)) => self
                .team_repo
                .get_membership(&team_id, &user.id)
                .await?
                .map(|member| TeamMembership {
                    is_team_admin: member.is_team_admin,
                }),
            _ => None,
        };
        Ok(resolve_model_permission(
            user.id,
            user.is_admin,
            model.user_id,
            model.access,
            model.default_permission,
            membership,
        ))
    }

    /// Loads the model and refuses unless the caller holds at least
    /// `required` on it.
    pub async fn require(
        &self,
        user: &User,
        model_id: &ModelId,
        required: ModelPermission,
    ) -> Result<Model, PermissionError> {
        let model = self
            .model_repo
            .get(model_id)
            .await?
            .ok_or(PermissionError::ModelNotFound(*model_id))?;
        let permission = self.permission_for(user, &model).await?;
        if permission >= required {
            Ok(model)
        } else {
            Err(PermissionError::Denied {
                model_id: *model_id,
                required,
            })
        }
    }
}
