pub mod basic;
pub mod keycloak;

use crate::model::User;
use crate::repo::RepoError;
use async_trait::async_trait;
use bazaar_common::SafeDisplay;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("direct signup is disabled")]
    SignupDisabled,
    #[error("user already exists: {0}")]
    UserExists(String),
    #[error("a password is required")]
    PasswordRequired,
    #[error("identity provider error: {0}")]
    Provider(String),
    #[error("password hashing failed: {0}")]
    Hashing(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for IdentityError {
    fn to_safe_string(&self) -> String {
        match self {
            IdentityError::InternalRepoError(inner) => inner.to_safe_string(),
            IdentityError::Hashing(_) => "internal credential error".to_string(),
            IdentityError::Provider(_) => "identity provider unavailable".to_string(),
            _ => self.to_string(),
        }
    }
}

/// The authentication capability set. `Basic` keeps credentials locally;
/// `Keycloak` trusts a provider-issued token and propagates user lifecycle
/// changes back to the provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn allow_direct_signup(&self) -> bool;

    async fn login_with_email(&self, login: &str, password: &str) -> Result<User, IdentityError>;

    /// Validates a provider-issued access token, provisioning a local user
    /// on first sight.
    async fn login_with_token(&self, access_token: &str) -> Result<User, IdentityError>;

    async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: Option<&str>,
        is_admin: bool,
        is_verified: bool,
    ) -> Result<User, IdentityError>;

    async fn verify_user(&self, user: &User) -> Result<(), IdentityError>;

    /// Provider-side cleanup only; the local row is removed by the caller so
    /// the last-admin invariant stays in one place.
    async fn delete_user(&self, user: &User) -> Result<(), IdentityError>;
}

pub(crate) fn hash_secret(secret: &str) -> Result<String, IdentityError> {
    use argon2::password_hash::rand_core::OsRng;
    use argon2::password_hash::{PasswordHasher, SaltString};

    let salt = SaltString::generate(&mut OsRng);
    argon2::Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| IdentityError::Hashing(e.to_string()))
}

pub(crate) fn verify_secret(secret: &str, hash: &str) -> bool {
    use argon2::password_hash::{PasswordHash, PasswordVerifier};

    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    argon2::Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_secret("hunter2").unwrap();
        assert!(verify_secret("hunter2", &hash));
        assert!(!verify_secret("hunter3", &hash));
        assert!(!verify_secret("hunter2", "not-a-phc-string"));
    }

    #[test]
    fn hashes_are_salted() {
        let first = hash_secret("same-password").unwrap();
        let second = hash_secret("same-password").unwrap();
        assert_ne!(first, second);
    }
}
