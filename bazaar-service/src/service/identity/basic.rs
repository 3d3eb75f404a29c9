use super::{hash_secret, verify_secret, IdentityError, IdentityProvider};
use crate::model::User;
use crate::repo::user::UserRepo;
use crate::repo::RepoError;
use async_trait::async_trait;
use bazaar_common::model::UserId;
use std::sync::Arc;

/// Email+password authentication with locally stored Argon2id hashes.
pub struct BasicIdentityProvider {
    user_repo: Arc<dyn UserRepo>,
}

impl BasicIdentityProvider {
    pub fn new(user_repo: Arc<dyn UserRepo>) -> Self {
        Self { user_repo }
    }
}

#[async_trait]
impl IdentityProvider for BasicIdentityProvider {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn allow_direct_signup(&self) -> bool {
        true
    }

    async fn login_with_email(&self, login: &str, password: &str) -> Result<User, IdentityError> {
        let user = match self.user_repo.get_by_email(login).await? {
            Some(user) => Some(user),
            None => self.user_repo.get_by_username(login).await?,
        };
        let Some(user) = user else {
            return Err(IdentityError::InvalidCredentials);
        };
        let Some(hash) = &user.password_hash else {
            return Err(IdentityError::InvalidCredentials);
        };
        if verify_secret(password, hash) {
            Ok(user)
        } else {
            Err(IdentityError::InvalidCredentials)
        }
    }

    async fn login_with_token(&self, _access_token: &str) -> Result<User, IdentityError> {
        Err(IdentityError::Provider(
            "token login is only available with an external identity provider".to_string(),
        ))
    }

    async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: Option<&str>,
        is_admin: bool,
        is_verified: bool,
    ) -> Result<User, IdentityError> {
        let password = password.ok_or(IdentityError::PasswordRequired)?;
        let user = User {
            id: UserId::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: Some(hash_secret(password)?),
            is_admin,
            is_verified,
        };
        match self.user_repo.create(&user).await {
            Ok(()) => Ok(user),
            Err(RepoError::UniqueViolation(_)) => {
                Err(IdentityError::UserExists(username.to_string()))
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn verify_user(&self, user: &User) -> Result<(), IdentityError> {
        self.user_repo.set_verified(&user.id, true).await?;
        Ok(())
    }

    async fn delete_user(&self, _user: &User) -> Result<(), IdentityError> {
        // credentials live in the users row; nothing external to clean up
        Ok(())
    }
}
