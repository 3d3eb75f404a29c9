use crate::model::{ModelId, UploadId, UserId};
use crate::SafeDisplay;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use poem::Request;
use poem_openapi::auth::{Basic, Bearer};
use poem_openapi::SecurityScheme;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

pub const AUTH_ERROR_MESSAGE: &str = "authorization error";

/// The raw credential presented by a caller: a platform JWT, a job token or
/// an API key, depending on the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenSecret {
    pub value: String,
}

impl TokenSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// Request-scoped slot the audit middleware plants into request extensions;
/// the auth layer fills it in once the principal is known so the middleware
/// can attribute the request after completion.
#[derive(Debug, Clone, Default)]
pub struct PrincipalSlot(Arc<OnceLock<Uuid>>);

impl PrincipalSlot {
    pub fn record(&self, user_id: UserId) {
        let _ = self.0.set(user_id.0);
    }

    pub fn get(&self) -> Option<UserId> {
        self.0.get().copied().map(UserId)
    }
}

/// Bearer credential plus the audit slot captured from the request.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub secret: TokenSecret,
    pub principal: PrincipalSlot,
}

#[derive(SecurityScheme)]
#[oai(rename = "Token", ty = "bearer", checker = "bearer_checker")]
pub struct BazaarSecurityScheme(pub AuthToken);

impl BazaarSecurityScheme {
    pub fn token(&self) -> &AuthToken {
        &self.0
    }
}

impl AsRef<TokenSecret> for BazaarSecurityScheme {
    fn as_ref(&self) -> &TokenSecret {
        &self.0.secret
    }
}

async fn bearer_checker(req: &Request, bearer: Bearer) -> Option<AuthToken> {
    Some(AuthToken {
        secret: TokenSecret::new(bearer.token),
        principal: req.extensions().get::<PrincipalSlot>().cloned().unwrap_or_default(),
    })
}

/// HTTP Basic credentials, accepted by the login endpoint only.
#[derive(SecurityScheme)]
#[oai(rename = "Login", ty = "basic")]
pub struct BasicSecurityScheme(pub Basic);

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl SafeDisplay for TokenError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

/// Claims of the platform JWT issued on login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformClaims {
    pub sub: Uuid,
    pub exp: i64,
    pub iat: i64,
}

impl PlatformClaims {
    pub fn new(user_id: UserId, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.0,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        }
    }

    pub fn user_id(&self) -> UserId {
        UserId(self.sub)
    }
}

/// Claims of the token handed to a launched job, authorizing status and log
/// callbacks for exactly one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobClaims {
    pub model_id: Uuid,
    pub exp: i64,
}

impl JobClaims {
    pub fn new(model_id: ModelId, ttl: Duration) -> Self {
        Self {
            model_id: model_id.0,
            exp: (Utc::now() + ttl).timestamp(),
        }
    }

    pub fn model_id(&self) -> ModelId {
        ModelId(self.model_id)
    }
}

/// Claims of the token scoping chunk and commit calls of one upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadClaims {
    pub upload_id: Uuid,
    pub exp: i64,
}

impl UploadClaims {
    pub fn new(upload_id: UploadId, ttl: Duration) -> Self {
        Self {
            upload_id: upload_id.0,
            exp: (Utc::now() + ttl).timestamp(),
        }
    }

    pub fn upload_id(&self) -> UploadId {
        UploadId(self.upload_id)
    }
}

/// HMAC codec around one signing key. The platform key and the job key are
/// two distinct instances so a leaked job token can never authenticate a
/// user-facing call.
#[derive(Clone)]
pub struct JwtKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKey {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn encode<C: Serialize>(&self, claims: &C) -> Result<String, TokenError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    pub fn decode<C: DeserializeOwned>(&self, token: &str) -> Result<C, TokenError> {
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode::<C>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn platform_token_round_trip() {
        let key = JwtKey::from_secret("test-secret");
        let user_id = UserId::new_v4();
        let token = key
            .encode(&PlatformClaims::new(user_id, Duration::minutes(15)))
            .unwrap();
        let claims: PlatformClaims = key.decode(&token).unwrap();
        assert_eq!(claims.user_id(), user_id);
    }

    #[test]
    fn expired_token_is_rejected() {
        let key = JwtKey::from_secret("test-secret");
        let token = key
            .encode(&PlatformClaims::new(
                UserId::new_v4(),
                Duration::minutes(-20),
            ))
            .unwrap();
        assert!(matches!(
            key.decode::<PlatformClaims>(&token),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn job_token_does_not_verify_under_platform_key() {
        let platform = JwtKey::from_secret("platform-secret");
        let jobs = JwtKey::from_secret("job-secret");
        let token = jobs
            .encode(&JobClaims::new(ModelId::new_v4(), Duration::hours(48)))
            .unwrap();
        assert!(matches!(
            platform.decode::<JobClaims>(&token),
            Err(TokenError::Invalid)
        ));
    }

    #[test]
    fn principal_slot_records_first_writer() {
        let slot = PrincipalSlot::default();
        assert_eq!(slot.get(), None);
        let first = UserId::new_v4();
        slot.record(first);
        slot.record(UserId::new_v4());
        assert_eq!(slot.get(), Some(first));
    }
}
