use crate::model::User;
use crate::repo::team::TeamRepo;
use crate::repo::user::{AdminFlagOutcome, UserDeleteOutcome, UserRepo};
use crate::repo::RepoError;
use crate::service::identity::{IdentityError, IdentityProvider};
use crate::service::model::{ModelService, ModelServiceError};
use crate::service::token::TokenService;
use bazaar_common::model::UserId;
use bazaar_common::SafeDisplay;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum UserServiceError {
    #[error("user not found: {0}")]
    UserNotFound(UserId),
    #[error("cannot remove the last admin")]
    LastAdmin,
    #[error("user still owns models that other models depend on")]
    OwnsDependedModels,
    #[error("token error: {0}")]
    Token(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Model(#[from] ModelServiceError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for UserServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            UserServiceError::Identity(inner) => inner.to_safe_string(),
            UserServiceError::Model(inner) => inner.to_safe_string(),
            UserServiceError::InternalRepoError(inner) => inner.to_safe_string(),
            UserServiceError::Token(_) => "internal token error".to_string(),
            _ => self.to_string(),
        }
    }
}

pub struct UserService {
    user_repo: Arc<dyn UserRepo>,
    team_repo: Arc<dyn TeamRepo>,
    identity: Arc<dyn IdentityProvider>,
    tokens: Arc<TokenService>,
    model_service: Arc<ModelService>,
}

impl UserService {
    pub fn new(
        user_repo: Arc<dyn UserRepo>,
        team_repo: Arc<dyn TeamRepo>,
        identity: Arc<dyn IdentityProvider>,
        tokens: Arc<TokenService>,
        model_service: Arc<ModelService>,
    ) -> Self {
        Self {
            user_repo,
            team_repo,
            identity,
            tokens,
            model_service,
        }
    }

    pub async fn signup(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<User, UserServiceError> {
        if !self.identity.allow_direct_signup() {
            return Err(IdentityError::SignupDisabled.into());
        }
        let user = self
            .identity
            .create_user(username, email, Some(password), false, false)
            .await?;
        info!(user_id = %user.id, username, "user signed up");
        Ok(user)
    }

    pub async fn login(
        &self,
        login: &str,
        password: &str,
    ) -> Result<(User, String), UserServiceError> {
        let user = self.identity.login_with_email(login, password).await?;
        let token = self
            .tokens
            .issue_platform(user.id)
            .map_err(|e| UserServiceError::Token(e.to_string()))?;
        Ok((user, token))
    }

    pub async fn login_with_token(
        &self,
        access_token: &str,
    ) -> Result<(User, String), UserServiceError> {
        let user = self.identity.login_with_token(access_token).await?;
        let token = self
            .tokens
            .issue_platform(user.id)
            .map_err(|e| UserServiceError::Token(e.to_string()))?;
        Ok((user, token))
    }

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: Option<&str>,
        is_admin: bool,
    ) -> Result<User, UserServiceError> {
        // admin-created accounts are verified from the start
        Ok(self
            .identity
            .create_user(username, email, password, is_admin, true)
            .await?)
    }

    /// Visibility-filtered listing: admins see everyone; other callers see
    /// themselves and users sharing at least one team.
    pub async fn list(&self, caller: &User) -> Result<Vec<User>, UserServiceError> {
        let all = self.user_repo.list().await?;
        if caller.is_admin {
            return Ok(all);
        }
        let mut visible: HashSet<UserId> = HashSet::new();
        visible.insert(caller.id);
        for membership in self.team_repo.teams_of_user(&caller.id).await? {
            for member in self.team_repo.members(&membership.team_id).await? {
                visible.insert(member.user_id);
            }
        }
        Ok(all
            .into_iter()
            .filter(|user| visible.contains(&user.id))
            .collect())
    }

    pub async fn get(&self, id: &UserId) -> Result<User, UserServiceError> {
        self.user_repo
            .get(id)
            .await?
            .ok_or(UserServiceError::UserNotFound(*id))
    }

    /// Deletes the account, its models (artifacts and jobs included) and its
    /// provider-side identity. Refused when another user's model depends on
    /// one of the target's models, or when the target is the last admin.
    pub async fn delete(&self, id: &UserId) -> Result<(), UserServiceError> {
        let user = self.get(id).await?;

        // models must go in dependency order; loop until no further model
        // can be removed
        let mut remaining = self.model_service.models_of_user(id).await?;
        while !remaining.is_empty() {
            let mut progressed = false;
            let mut still_blocked = Vec::new();
            for model in remaining {
                match self.model_service.purge(&model.id).await {
                    Ok(()) => progressed = true,
                    Err(ModelServiceError::HasDependents) => still_blocked.push(model),
                    Err(other) => return Err(other.into()),
                }
            }
            if !progressed {
                return Err(UserServiceError::OwnsDependedModels);
            }
            remaining = still_blocked;
        }

        self.identity.delete_user(&user).await?;
        match self.user_repo.delete(id).await? {
            UserDeleteOutcome::Deleted => {
                info!(user_id = %id, "deleted user");
                Ok(())
            }
            UserDeleteOutcome::LastAdmin => Err(UserServiceError::LastAdmin),
            UserDeleteOutcome::NotFound => Err(UserServiceError::UserNotFound(*id)),
        }
    }

    pub async fn set_admin(&self, id: &UserId, is_admin: bool) -> Result<(), UserServiceError> {
        match self.user_repo.set_admin(id, is_admin).await? {
            AdminFlagOutcome::Updated => Ok(()),
            AdminFlagOutcome::LastAdmin => Err(UserServiceError::LastAdmin),
            AdminFlagOutcome::NotFound => Err(UserServiceError::UserNotFound(*id)),
        }
    }

    pub async fn verify(&self, id: &UserId) -> Result<(), UserServiceError> {
        let user = self.get(id).await?;
        self.identity.verify_user(&user).await?;
        Ok(())
    }

    /// Makes sure the configured admin account exists; runs at every boot.
    pub async fn ensure_initial_admin(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(), UserServiceError> {
        if self.user_repo.get_by_email(email).await?.is_some() {
            return Ok(());
        }
        info!(username, "creating initial admin account");
        match self
            .identity
            .create_user(username, email, Some(password), true, true)
            .await
        {
            Ok(_) => Ok(()),
            // a concurrent boot created it first
            Err(IdentityError::UserExists(_)) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }
}
