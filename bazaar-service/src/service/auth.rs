use crate::model::User;
use crate::repo::user::UserRepo;
use crate::repo::RepoError;
use crate::service::token::TokenService;
use async_trait::async_trait;
use bazaar_common::auth::AuthToken;
use bazaar_common::model::{ModelId, UploadId};
use bazaar_common::SafeDisplay;
use std::sync::Arc;

/// The authenticated principal of one request.
#[derive(Debug, Clone)]
pub struct AuthCtx {
    pub user: User,
}

impl AuthCtx {
    pub fn ensure_admin(&self) -> Result<(), AuthServiceError> {
        if self.user.is_admin {
            Ok(())
        } else {
            Err(AuthServiceError::AdminRequired)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthServiceError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("account not found")]
    UnknownAccount,
    #[error("administrator privileges required")]
    AdminRequired,
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for AuthServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            AuthServiceError::InternalRepoError(inner) => inner.to_safe_string(),
            _ => self.to_string(),
        }
    }
}

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Platform JWT -> loaded user. Fills the request's audit principal slot
    /// as a side effect.
    async fn authorization(&self, token: &AuthToken) -> Result<AuthCtx, AuthServiceError>;

    /// Job-token check for status/log callbacks; returns the model the token
    /// was minted for.
    async fn job_authorization(&self, token: &AuthToken) -> Result<ModelId, AuthServiceError>;

    /// Upload-token check for chunk and commit calls.
    async fn upload_authorization(&self, token: &AuthToken) -> Result<UploadId, AuthServiceError>;
}

pub struct AuthServiceDefault {
    user_repo: Arc<dyn UserRepo>,
    tokens: Arc<TokenService>,
}

impl AuthServiceDefault {
    pub fn new(user_repo: Arc<dyn UserRepo>, tokens: Arc<TokenService>) -> Self {
        Self { user_repo, tokens }
    }
}

#[async_trait]
impl AuthService for AuthServiceDefault {
    async fn authorization(&self, token: &AuthToken) -> Result<AuthCtx, AuthServiceError> {
        let claims = self
            .tokens
            .verify_platform(&token.secret.value)
            .map_err(|e| AuthServiceError::InvalidToken(e.to_string()))?;
        let user = self
            .user_repo
            .get(&claims.user_id())
            .await?
            .ok_or(AuthServiceError::UnknownAccount)?;
        token.principal.record(user.id);
        Ok(AuthCtx { user })
    }

    async fn job_authorization(&self, token: &AuthToken) -> Result<ModelId, AuthServiceError> {
        self.tokens
            .verify_job(&token.secret.value)
            .map(|claims| claims.model_id())
            .map_err(|e| AuthServiceError::InvalidToken(e.to_string()))
    }

    async fn upload_authorization(&self, token: &AuthToken) -> Result<UploadId, AuthServiceError> {
        self.tokens
            .verify_upload(&token.secret.value)
            .map(|claims| claims.upload_id())
            .map_err(|e| AuthServiceError::InvalidToken(e.to_string()))
    }
}
