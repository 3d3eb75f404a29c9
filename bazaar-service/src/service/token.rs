use crate::config::JwtConfig;
use bazaar_common::auth::{JobClaims, JwtKey, PlatformClaims, TokenError, UploadClaims};
use bazaar_common::model::{ModelId, UploadId, UserId};
use chrono::Duration;

/// Issues and verifies every token kind the platform signs. The job key is
/// distinct from the platform key so job and upload tokens never
/// authenticate user-facing endpoints.
pub struct TokenService {
    platform: JwtKey,
    jobs: JwtKey,
    platform_ttl: Duration,
}

impl TokenService {
    pub fn new(config: &JwtConfig, platform_ttl: std::time::Duration) -> Self {
        Self {
            platform: JwtKey::from_secret(&config.secret),
            jobs: JwtKey::from_secret(&config.job_secret),
            platform_ttl: Duration::from_std(platform_ttl).unwrap_or_else(|_| Duration::minutes(15)),
        }
    }

    pub fn issue_platform(&self, user_id: UserId) -> Result<String, TokenError> {
        self.platform
            .encode(&PlatformClaims::new(user_id, self.platform_ttl))
    }

    pub fn verify_platform(&self, token: &str) -> Result<PlatformClaims, TokenError> {
        self.platform.decode(token)
    }

    pub fn issue_job(&self, model_id: ModelId, ttl: Duration) -> Result<String, TokenError> {
        self.jobs.encode(&JobClaims::new(model_id, ttl))
    }

    pub fn verify_job(&self, token: &str) -> Result<JobClaims, TokenError> {
        self.jobs.decode(token)
    }

    pub fn issue_upload(&self, upload_id: UploadId, ttl: Duration) -> Result<String, TokenError> {
        self.jobs.encode(&UploadClaims::new(upload_id, ttl))
    }

    pub fn verify_upload(&self, token: &str) -> Result<UploadClaims, TokenError> {
        self.jobs.decode(token)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn service() -> TokenService {
        TokenService::new(&JwtConfig::default(), std::time::Duration::from_secs(900))
    }

    #[test]
    fn platform_tokens_round_trip() {
        let tokens = service();
        let user_id = UserId::new_v4();
        let token = tokens.issue_platform(user_id).unwrap();
        assert_eq!(tokens.verify_platform(&token).unwrap().user_id(), user_id);
    }

    #[test]
    fn job_tokens_are_not_platform_tokens() {
        let tokens = service();
        let job_token = tokens
            .issue_job(ModelId::new_v4(), Duration::hours(72))
            .unwrap();
        assert!(tokens.verify_platform(&job_token).is_err());
    }

    #[test]
    fn upload_tokens_are_scoped_to_their_session() {
        let tokens = service();
        let upload_id = UploadId::new_v4();
        let token = tokens.issue_upload(upload_id, Duration::hours(24)).unwrap();
        assert_eq!(
            tokens.verify_upload(&token).unwrap().upload_id(),
            upload_id
        );
    }
}
