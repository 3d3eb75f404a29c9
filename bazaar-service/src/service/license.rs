use crate::config::LicenseConfig;
use bazaar_common::SafeDisplay;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseClaims {
    pub bolt_license_key: String,
    pub cpu_mhz_limit: u64,
    pub exp: i64,
}

/// Returned to launchers on a successful check; the key is forwarded to the
/// job environment.
#[derive(Debug, Clone)]
pub struct LicenseGrant {
    pub bolt_license_key: String,
    pub cpu_mhz_limit: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum LicenseError {
    #[error("license file could not be read: {0}")]
    Unreadable(String),
    #[error("license is invalid: {0}")]
    Invalid(String),
    #[error("license expired")]
    Expired,
    #[error("license does not cover the requested cluster load: requested {requested} MHz, licensed {limit} MHz")]
    CpuLimitExceeded { requested: u64, limit: u64 },
}

impl SafeDisplay for LicenseError {
    fn to_safe_string(&self) -> String {
        match self {
            LicenseError::Unreadable(_) => "license file could not be read".to_string(),
            _ => self.to_string(),
        }
    }
}

/// The license is a signed claim set (Ed25519) embedding a CPU ceiling and
/// an expiry. Loaded once at boot, re-checked at every job start.
pub enum LicenseService {
    /// Development mode: every check passes.
    Unlicensed,
    Verified { claims: LicenseClaims },
}

impl LicenseService {
    pub fn load(config: &LicenseConfig) -> Result<Self, LicenseError> {
        if config.mode != "verified" {
            info!("running unlicensed; job CPU checks are disabled");
            return Ok(LicenseService::Unlicensed);
        }

        let token = std::fs::read_to_string(&config.path)
            .map_err(|e| LicenseError::Unreadable(format!("{}: {e}", config.path.display())))?;
        let key = DecodingKey::from_ed_pem(config.public_key_pem.as_bytes())
            .map_err(|e| LicenseError::Invalid(format!("bad public key: {e}")))?;
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = true;
        let claims = jsonwebtoken::decode::<LicenseClaims>(token.trim(), &key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => LicenseError::Expired,
                _ => LicenseError::Invalid(e.to_string()),
            })?
            .claims;
        info!(
            cpu_mhz_limit = claims.cpu_mhz_limit,
            "verified cluster license"
        );
        Ok(LicenseService::Verified { claims })
    }

    /// Checks that the cluster, including the job about to start, stays
    /// within the licensed CPU ceiling.
    pub fn verify(&self, requested_total_mhz: u64) -> Result<LicenseGrant, LicenseError> {
        match self {
            LicenseService::Unlicensed => Ok(LicenseGrant {
                bolt_license_key: "unlicensed".to_string(),
                cpu_mhz_limit: None,
            }),
            LicenseService::Verified { claims } => {
                if claims.exp < Utc::now().timestamp() {
                    return Err(LicenseError::Expired);
                }
                if requested_total_mhz > claims.cpu_mhz_limit {
                    return Err(LicenseError::CpuLimitExceeded {
                        requested: requested_total_mhz,
                        limit: claims.cpu_mhz_limit,
                    });
                }
                Ok(LicenseGrant {
                    bolt_license_key: claims.bolt_license_key.clone(),
                    cpu_mhz_limit: Some(claims.cpu_mhz_limit),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn verified(limit: u64, exp_offset_secs: i64) -> LicenseService {
        LicenseService::Verified {
            claims: LicenseClaims {
                bolt_license_key: "key-123".to_string(),
                cpu_mhz_limit: limit,
                exp: Utc::now().timestamp() + exp_offset_secs,
            },
        }
    }

    #[test]
    fn unlicensed_always_passes() {
        let license = LicenseService::Unlicensed;
        assert!(license.verify(u64::MAX).is_ok());
    }

    #[test]
    fn verify_enforces_cpu_ceiling() {
        let license = verified(10_000, 3600);
        assert!(license.verify(10_000).is_ok());
        assert!(matches!(
            license.verify(10_001),
            Err(LicenseError::CpuLimitExceeded {
                requested: 10_001,
                limit: 10_000
            })
        ));
    }

    #[test]
    fn verify_rejects_expired_license() {
        let license = verified(10_000, -60);
        assert!(matches!(license.verify(1), Err(LicenseError::Expired)));
    }
}
