use crate::model::{ApiKey, User};
use crate::repo::api_key::{ApiKeyRecord, ApiKeyRepo};
use crate::repo::user::UserRepo;
use crate::repo::RepoError;
use crate::service::identity::{hash_secret, verify_secret};
use crate::service::permission::{PermissionError, PermissionService};
use bazaar_common::model::{ApiKeyId, ModelId, ModelPermission, UserId};
use bazaar_common::SafeDisplay;
use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const API_KEY_PREFIX: &str = "mbk-";
const SECRET_LENGTH: usize = 40;

#[derive(Debug, thiserror::Error)]
pub enum ApiKeyError {
    #[error("invalid api key")]
    Invalid,
    #[error("api key expired")]
    Expired,
    #[error("api key does not grant access to model {0}")]
    NotAllowed(ModelId),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error("credential hashing failed: {0}")]
    Hashing(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for ApiKeyError {
    fn to_safe_string(&self) -> String {
        match self {
            ApiKeyError::Permission(inner) => inner.to_safe_string(),
            ApiKeyError::InternalRepoError(inner) => inner.to_safe_string(),
            ApiKeyError::Hashing(_) => "internal credential error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Opaque API keys of the form `mbk-<key id>.<secret>`. Only an Argon2id
/// hash of the secret is stored; the plaintext is returned exactly once.
pub struct ApiKeyService {
    api_key_repo: Arc<dyn ApiKeyRepo>,
    user_repo: Arc<dyn UserRepo>,
    permissions: Arc<PermissionService>,
}

impl ApiKeyService {
    pub fn new(
        api_key_repo: Arc<dyn ApiKeyRepo>,
        user_repo: Arc<dyn UserRepo>,
        permissions: Arc<PermissionService>,
    ) -> Self {
        Self {
            api_key_repo,
            user_repo,
            permissions,
        }
    }

    pub async fn create(
        &self,
        owner: &User,
        name: &str,
        model_ids: &[ModelId],
        all_models: bool,
        expires_at: DateTime<Utc>,
    ) -> Result<String, ApiKeyError> {
        // the caller must hold at least read on every model the key is
        // scoped to
        for model_id in model_ids {
            self.permissions
                .require(owner, model_id, ModelPermission::Read)
                .await?;
        }

        let id = ApiKeyId::new_v4();
        let secret: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_LENGTH)
            .map(char::from)
            .collect();
        let record = ApiKeyRecord {
            id: id.0,
            secret_hash: hash_secret(&secret).map_err(|e| ApiKeyError::Hashing(e.to_string()))?,
            name: name.to_string(),
            user_id: owner.id.0,
            expires_at,
            all_models,
        };
        self.api_key_repo.create(&record, model_ids).await?;
        info!(key_id = %id, owner = %owner.id, "created api key");
        Ok(format!("{API_KEY_PREFIX}{}.{secret}", id.0.simple()))
    }

    pub async fn list(&self, owner: &UserId) -> Result<Vec<(ApiKey, Vec<ModelId>)>, ApiKeyError> {
        let keys = self.api_key_repo.list_of_owner(owner).await?;
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            let models = self.api_key_repo.models_of(&key.id).await?;
            result.push((key, models));
        }
        Ok(result)
    }

    pub async fn delete(&self, owner: &UserId, id: &ApiKeyId) -> Result<bool, ApiKeyError> {
        Ok(self.api_key_repo.delete(id, owner).await?)
    }

    /// Full API-key authorization: parse, verify hash, check expiry and
    /// model scope, then re-run the model permission check for the key's
    /// owner.
    pub async fn authorize(
        &self,
        raw_key: &str,
        model_id: &ModelId,
        required: ModelPermission,
    ) -> Result<User, ApiKeyError> {
        let (id, secret) = parse_api_key(raw_key).ok_or(ApiKeyError::Invalid)?;

        let record = self
            .api_key_repo
            .get(&id)
            .await?
            .ok_or(ApiKeyError::Invalid)?;

        if record.expires_at < Utc::now() {
            // expired keys are revoked on sight
            self.api_key_repo
                .delete(&id, &UserId(record.user_id))
                .await?;
            return Err(ApiKeyError::Expired);
        }

        if !verify_secret(&secret, &record.secret_hash) {
            return Err(ApiKeyError::Invalid);
        }

        if !record.all_models {
            let allowed = self.api_key_repo.models_of(&id).await?;
            if !allowed.contains(model_id) {
                return Err(ApiKeyError::NotAllowed(*model_id));
            }
        }

        let owner = self
            .user_repo
            .get(&UserId(record.user_id))
            .await?
            .ok_or(ApiKeyError::Invalid)?;
        self.permissions.require(&owner, model_id, required).await?;
        Ok(owner)
    }
}

/// Splits `mbk-<id>.<secret>`; returns `None` for anything malformed.
pub fn parse_api_key(raw: &str) -> Option<(ApiKeyId, String)> {
    let rest = raw.strip_prefix(API_KEY_PREFIX)?;
    let (id, secret) = rest.split_once('.')?;
    if secret.is_empty() {
        return None;
    }
    let id = Uuid::parse_str(id).ok()?;
    Some((ApiKeyId(id), secret.to_string()))
}

/// Bearer credentials on deployment endpoints may be API keys instead of
/// platform JWTs; the prefix tells them apart.
pub fn looks_like_api_key(raw: &str) -> bool {
    raw.starts_with(API_KEY_PREFIX)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn parse_accepts_well_formed_keys() {
        let id = Uuid::new_v4();
        let raw = format!("mbk-{}.abcDEF123", id.simple());
        let (parsed, secret) = parse_api_key(&raw).unwrap();
        assert_eq!(parsed.0, id);
        assert_eq!(secret, "abcDEF123");
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!(parse_api_key("mbk-no-dot-here").is_none());
        assert!(parse_api_key("wrong-prefix.secret").is_none());
        assert!(parse_api_key("mbk-not-a-uuid.secret").is_none());
        assert!(parse_api_key(&format!("mbk-{}.", Uuid::new_v4().simple())).is_none());
    }

    #[test]
    fn api_keys_are_distinguishable_from_jwts() {
        assert!(looks_like_api_key("mbk-abc.def"));
        assert!(!looks_like_api_key("eyJhbGciOiJIUzI1NiJ9.payload.sig"));
    }
}
