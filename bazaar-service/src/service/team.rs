use crate::model::{Team, TeamMember, User};
use crate::repo::model::ModelRepo;
use crate::repo::team::TeamRepo;
use crate::repo::RepoError;
use bazaar_common::model::{ModelId, ModelPermission, TeamId, UserId};
use bazaar_common::SafeDisplay;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum TeamServiceError {
    #[error("team not found: {0}")]
    TeamNotFound(TeamId),
    #[error("user is not a member of the team")]
    NotAMember,
    #[error("team admin privileges required")]
    TeamAdminRequired,
    #[error("team with this name already exists")]
    NameTaken,
    #[error("model not found: {0}")]
    ModelNotFound(ModelId),
    #[error("only the model owner can move a model into a team")]
    ModelOwnerRequired,
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for TeamServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            TeamServiceError::InternalRepoError(inner) => inner.to_safe_string(),
            _ => self.to_string(),
        }
    }
}

pub struct TeamService {
    team_repo: Arc<dyn TeamRepo>,
    model_repo: Arc<dyn ModelRepo>,
}

impl TeamService {
    pub fn new(team_repo: Arc<dyn TeamRepo>, model_repo: Arc<dyn ModelRepo>) -> Self {
        Self {
            team_repo,
            model_repo,
        }
    }

    /// Global admins pass every team guard; team admins pass for their own
    /// team.
    pub async fn ensure_team_admin(
        &self,
        caller: &User,
        team_id: &TeamId,
    ) -> Result<(), TeamServiceError> {
        if caller.is_admin {
            return Ok(());
        }
        match self.team_repo.get_membership(team_id, &caller.id).await? {
            Some(member) if member.is_team_admin => Ok(()),
            Some(_) => Err(TeamServiceError::TeamAdminRequired),
            None => Err(TeamServiceError::NotAMember),
        }
    }

    pub async fn ensure_member(
        &self,
        caller: &User,
        team_id: &TeamId,
    ) -> Result<(), TeamServiceError> {
        if caller.is_admin {
            return Ok(());
        }
        match self.team_repo.get_membership(team_id, &caller.id).await? {
            Some(_) => Ok(()),
            None => Err(TeamServiceError::NotAMember),
        }
    }

    pub async fn create(&self, name: &str) -> Result<Team, TeamServiceError> {
        let team = Team {
            id: TeamId::new_v4(),
            name: name.to_string(),
        };
        match self.team_repo.create(&team).await {
            Ok(()) => {
                info!(team_id = %team.id, name, "created team");
                Ok(team)
            }
            Err(RepoError::UniqueViolation(_)) => Err(TeamServiceError::NameTaken),
            Err(other) => Err(other.into()),
        }
    }

    pub async fn get(&self, id: &TeamId) -> Result<Team, TeamServiceError> {
        self.team_repo
            .get(id)
            .await?
            .ok_or(TeamServiceError::TeamNotFound(*id))
    }

    pub async fn list(&self) -> Result<Vec<Team>, TeamServiceError> {
        Ok(self.team_repo.list().await?)
    }

    pub async fn add_member(
        &self,
        caller: &User,
        team_id: &TeamId,
        user_id: &UserId,
        is_team_admin: bool,
    ) -> Result<(), TeamServiceError> {
        self.get(team_id).await?;
        self.ensure_team_admin(caller, team_id).await?;
        self.team_repo
            .add_member(team_id, user_id, is_team_admin)
            .await?;
        Ok(())
    }

    pub async fn remove_member(
        &self,
        caller: &User,
        team_id: &TeamId,
        user_id: &UserId,
    ) -> Result<(), TeamServiceError> {
        self.ensure_team_admin(caller, team_id).await?;
        if !self.team_repo.remove_member(team_id, user_id).await? {
            return Err(TeamServiceError::NotAMember);
        }
        Ok(())
    }

    pub async fn set_team_admin(
        &self,
        caller: &User,
        team_id: &TeamId,
        user_id: &UserId,
        is_team_admin: bool,
    ) -> Result<(), TeamServiceError> {
        self.ensure_team_admin(caller, team_id).await?;
        if !self
            .team_repo
            .set_team_admin(team_id, user_id, is_team_admin)
            .await?
        {
            return Err(TeamServiceError::NotAMember);
        }
        Ok(())
    }

    pub async fn members(&self, team_id: &TeamId) -> Result<Vec<TeamMember>, TeamServiceError> {
        self.get(team_id).await?;
        Ok(self.team_repo.members(team_id).await?)
    }

    /// Team-admin plus model-owner guard: moving a model into a team shares
    /// it, so both sides must agree.
    pub async fn add_model(
        &self,
        caller: &User,
        team_id: &TeamId,
        model_id: &ModelId,
    ) -> Result<(), TeamServiceError> {
        self.get(team_id).await?;
        self.ensure_team_admin(caller, team_id).await?;
        let model = self
            .model_repo
            .get(model_id)
            .await?
            .ok_or(TeamServiceError::ModelNotFound(*model_id))?;
        let permission = if caller.is_admin || model.user_id == caller.id {
            ModelPermission::Owner
        } else {
            ModelPermission::None
        };
        if permission < ModelPermission::Owner {
            return Err(TeamServiceError::ModelOwnerRequired);
        }
        self.model_repo.set_team(model_id, Some(*team_id)).await?;
        Ok(())
    }

    pub async fn remove_model(
        &self,
        caller: &User,
        team_id: &TeamId,
        model_id: &ModelId,
    ) -> Result<(), TeamServiceError> {
        self.ensure_team_admin(caller, team_id).await?;
        let model = self
            .model_repo
            .get(model_id)
            .await?
            .ok_or(TeamServiceError::ModelNotFound(*model_id))?;
        if model.team_id != Some(*team_id) {
            return Err(TeamServiceError::ModelNotFound(*model_id));
        }
        if !caller.is_admin && model.user_id != caller.id {
            return Err(TeamServiceError::ModelOwnerRequired);
        }
        self.model_repo.set_team(model_id, None).await?;
        Ok(())
    }
}
