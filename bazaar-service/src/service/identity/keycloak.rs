use super::{IdentityError, IdentityProvider};
use crate::config::KeycloakConfig;
use crate::model::User;
use crate::repo::user::UserRepo;
use crate::repo::RepoError;
use async_trait::async_trait;
use bazaar_common::model::UserId;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    preferred_username: Option<String>,
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
}

#[derive(Debug, Deserialize)]
struct AdminToken {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct KeycloakUser {
    id: String,
}

/// External OIDC authentication: tokens are validated against Keycloak's
/// userinfo endpoint, users are provisioned locally on first sight, and
/// lifecycle changes propagate through the Keycloak admin API.
pub struct KeycloakIdentityProvider {
    user_repo: Arc<dyn UserRepo>,
    config: KeycloakConfig,
    client: reqwest::Client,
}

impl KeycloakIdentityProvider {
    pub fn new(user_repo: Arc<dyn UserRepo>, config: KeycloakConfig) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| IdentityError::Provider(e.to_string()))?;
        Ok(Self {
            user_repo,
            config,
            client,
        })
    }

    fn base(&self) -> &str {
        self.config.server_url.trim_end_matches('/')
    }

    async fn admin_token(&self) -> Result<String, IdentityError> {
        let url = format!(
            "{}/realms/master/protocol/openid-connect/token",
            self.base()
        );
        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "password"),
                ("client_id", "admin-cli"),
                ("username", &self.config.admin_username),
                ("password", &self.config.admin_password),
            ])
            .send()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?
            .error_for_status()
            .map_err(|e| IdentityError::Provider(e.to_string()))?;
        let token: AdminToken = response
            .json()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?;
        Ok(token.access_token)
    }

    async fn find_provider_user(&self, email: &str) -> Result<Option<String>, IdentityError> {
        let admin_token = self.admin_token().await?;
        let url = format!(
            "{}/admin/realms/{}/users?email={}&exact=true",
            self.base(),
            self.config.realm,
            email
        );
        let users: Vec<KeycloakUser> = self
            .client
            .get(&url)
            .bearer_auth(&admin_token)
            .send()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?
            .error_for_status()
            .map_err(|e| IdentityError::Provider(e.to_string()))?
            .json()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?;
        Ok(users.into_iter().next().map(|u| u.id))
    }

    async fn provision(&self, info: &UserInfo) -> Result<User, IdentityError> {
        let email = info
            .email
            .clone()
            .ok_or_else(|| IdentityError::Provider("userinfo carried no email".to_string()))?;
        let username = info
            .preferred_username
            .clone()
            .unwrap_or_else(|| email.clone());

        if let Some(existing) = self.user_repo.get_by_email(&email).await? {
            return Ok(existing);
        }

        info!(email, "provisioning user from identity provider");
        let user = User {
            id: UserId::new_v4(),
            username,
            email: email.clone(),
            password_hash: None,
            is_admin: false,
            is_verified: info.email_verified,
        };
        match self.user_repo.create(&user).await {
            Ok(()) => Ok(user),
            // a concurrent first-login raced us; the row is there now
            Err(RepoError::UniqueViolation(_)) => self
                .user_repo
                .get_by_email(&email)
                .await?
                .ok_or(IdentityError::InvalidCredentials),
            Err(other) => Err(other.into()),
        }
    }
}

#[async_trait]
impl IdentityProvider for KeycloakIdentityProvider {
    fn name(&self) -> &'static str {
        "keycloak"
    }

    fn allow_direct_signup(&self) -> bool {
        false
    }

    async fn login_with_email(&self, _login: &str, _password: &str) -> Result<User, IdentityError> {
        Err(IdentityError::Provider(
            "password login is handled by the identity provider".to_string(),
        ))
    }

    async fn login_with_token(&self, access_token: &str) -> Result<User, IdentityError> {
        let url = format!(
            "{}/realms/{}/protocol/openid-connect/userinfo",
            self.base(),
            self.config.realm
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(IdentityError::InvalidCredentials);
        }
        let info: UserInfo = response
            .error_for_status()
            .map_err(|e| IdentityError::Provider(e.to_string()))?
            .json()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?;
        self.provision(&info).await
    }

    async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: Option<&str>,
        is_admin: bool,
        is_verified: bool,
    ) -> Result<User, IdentityError> {
        let admin_token = self.admin_token().await?;
        let url = format!("{}/admin/realms/{}/users", self.base(), self.config.realm);
        let mut body = json!({
            "username": username,
            "email": email,
            "enabled": true,
            "emailVerified": is_verified,
        });
        if let Some(password) = password {
            body["credentials"] = json!([{
                "type": "password",
                "value": password,
                "temporary": false,
            }]);
        }
        let response = self
            .client
            .post(&url)
            .bearer_auth(&admin_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| IdentityError::Provider(e.to_string()))?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(IdentityError::UserExists(username.to_string()));
        }
        response
            .error_for_status()
            .map_err(|e| IdentityError::Provider(e.to_string()))?;

        let user = User {
            id: UserId::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: None,
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
        if let Some(provider_id) = self.find_provider_user(&user.email).await? {
            let admin_token = self.admin_token().await?;
            let url = format!(
                "{}/admin/realms/{}/users/{}",
                self.base(),
                self.config.realm,
                provider_id
            );
            self.client
                .put(&url)
                .bearer_auth(&admin_token)
                .json(&json!({ "emailVerified": true }))
                .send()
                .await
                .map_err(|e| IdentityError::Provider(e.to_string()))?
                .error_for_status()
                .map_err(|e| IdentityError::Provider(e.to_string()))?;
        }
        self.user_repo.set_verified(&user.id, true).await?;
        Ok(())
    }

    async fn delete_user(&self, user: &User) -> Result<(), IdentityError> {
        if let Some(provider_id) = self.find_provider_user(&user.email).await? {
            let admin_token = self.admin_token().await?;
            let url = format!(
                "{}/admin/realms/{}/users/{}",
                self.base(),
                self.config.realm,
                provider_id
            );
            self.client
                .delete(&url)
                .bearer_auth(&admin_token)
                .send()
                .await
                .map_err(|e| IdentityError::Provider(e.to_string()))?
                .error_for_status()
                .map_err(|e| IdentityError::Provider(e.to_string()))?;
        }
        Ok(())
    }
}
