use bazaar_common::config::{ConfigLoader, DbConfig, EnvMapping};
use bazaar_common::tracing::TracingConfig;
use bazaar_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variables accepted by the server, mapped onto config keys.
/// `__` separates nesting levels.
pub const ENV_MAPPINGS: &[EnvMapping] = &[
    ("INGRESS_HOSTNAME", "ingress_hostname"),
    ("PRIVATE_MODEL_BAZAAR_ENDPOINT", "public_endpoint"),
    ("SHARE_DIR", "share_dir"),
    ("DATABASE_URI", "db__uri"),
    ("GRAFANA_DB_URL", "grafana_db_url"),
    ("JWT_SECRET", "jwt__secret"),
    ("JOB_TOKEN_SECRET", "jwt__job_secret"),
    ("ADMIN_USERNAME", "admin__username"),
    ("ADMIN_MAIL", "admin__email"),
    ("ADMIN_PASSWORD", "admin__password"),
    ("IDENTITY_PROVIDER", "identity__provider"),
    ("KEYCLOAK_SERVER_URL", "identity__keycloak__server_url"),
    ("KEYCLOAK_REALM", "identity__keycloak__realm"),
    ("KEYCLOAK_ADMIN_USERNAME", "identity__keycloak__admin_username"),
    ("KEYCLOAK_ADMIN_PASSWORD", "identity__keycloak__admin_password"),
    ("NOMAD_ENDPOINT", "orchestrator__nomad_endpoint"),
    ("TASK_RUNNER_TOKEN", "orchestrator__nomad_token"),
    ("NOMAD_DATACENTER", "orchestrator__datacenter"),
    ("KUBERNETES", "orchestrator__kubernetes"),
    ("KUBERNETES_NAMESPACE", "orchestrator__namespace"),
    ("JOB_DRIVER", "driver__mode"),
    ("DOCKER_REGISTRY", "driver__registry"),
    ("TAG", "driver__tag"),
    ("PYTHON_PATH", "driver__interpreter"),
    ("LICENSE_MODE", "license__mode"),
    ("LICENSE_PATH", "license__path"),
    ("LICENSE_PUBLIC_KEY", "license__public_key_pem"),
];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BazaarConfig {
    pub tracing: TracingConfig,
    pub http_port: u16,
    /// Hostname the ingress serves deployments under.
    pub ingress_hostname: String,
    /// Base URL jobs use to reach the control plane for callbacks.
    pub public_endpoint: String,
    pub share_dir: PathBuf,
    pub db: DbConfig,
    pub grafana_db_url: Option<String>,
    pub jwt: JwtConfig,
    pub admin: AdminConfig,
    pub identity: IdentityConfig,
    pub orchestrator: OrchestratorConfig,
    pub driver: DriverConfig,
    pub license: LicenseConfig,
    pub reconciler: ReconcilerConfig,
    pub uploads: UploadConfig,
    pub platform: PlatformJobsConfig,
    pub cors_origin_regex: String,
}

impl Default for BazaarConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("bazaar-service"),
            http_port: 8080,
            ingress_hostname: "localhost".to_string(),
            public_endpoint: "http://localhost:8080".to_string(),
            share_dir: PathBuf::from("/model_bazaar"),
            db: DbConfig::default(),
            grafana_db_url: None,
            jwt: JwtConfig::default(),
            admin: AdminConfig::default(),
            identity: IdentityConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            driver: DriverConfig::default(),
            license: LicenseConfig::default(),
            reconciler: ReconcilerConfig::default(),
            uploads: UploadConfig::default(),
            platform: PlatformJobsConfig::default(),
            cors_origin_regex: "http://localhost:.*".to_string(),
        }
    }
}

impl SafeDisplay for BazaarConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "ingress hostname: {}", self.ingress_hostname);
        let _ = writeln!(&mut result, "public endpoint: {}", self.public_endpoint);
        let _ = writeln!(&mut result, "share dir: {}", self.share_dir.display());
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "admin:");
        let _ = writeln!(&mut result, "{}", self.admin.to_safe_string_indented());
        let _ = writeln!(&mut result, "identity:");
        let _ = writeln!(&mut result, "{}", self.identity.to_safe_string_indented());
        let _ = writeln!(&mut result, "orchestrator:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.orchestrator.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "driver:");
        let _ = writeln!(&mut result, "{}", self.driver.to_safe_string_indented());
        let _ = writeln!(&mut result, "license:");
        let _ = writeln!(&mut result, "{}", self.license.to_safe_string_indented());
        result
    }
}

impl BazaarConfig {
    /// Cross-field validation: exactly one orchestrator, a complete identity
    /// provider block and a usable job driver.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match (
            self.orchestrator.nomad_endpoint.as_deref(),
            self.orchestrator.kubernetes_enabled(),
        ) {
            (Some(_), true) => {
                errors.push("NOMAD_ENDPOINT and KUBERNETES are mutually exclusive".to_string())
            }
            (None, false) => {
                errors.push("one of NOMAD_ENDPOINT or KUBERNETES=1 is required".to_string())
            }
            (Some(_), false) if self.orchestrator.nomad_token.is_none() => {
                errors.push("NOMAD_ENDPOINT requires TASK_RUNNER_TOKEN".to_string())
            }
            _ => {}
        }

        match self.identity.provider.as_str() {
            "basic" => {
                if !self.identity.keycloak.server_url.is_empty() {
                    errors.push(
                        "basic identity provider does not accept KEYCLOAK_* settings".to_string(),
                    );
                }
            }
            "keycloak" => {
                if self.identity.keycloak.server_url.is_empty() {
                    errors.push("keycloak identity provider requires KEYCLOAK_SERVER_URL".to_string());
                }
            }
            other => errors.push(format!(
                "IDENTITY_PROVIDER must be one of basic, keycloak; got {other}"
            )),
        }

        match self.driver.mode.as_str() {
            "docker" => {
                if self.driver.tag.is_none() {
                    errors.push("docker job driver requires TAG".to_string());
                }
            }
            "local" => {}
            other => errors.push(format!("JOB_DRIVER must be docker or local; got {other}")),
        }

        match self.license.mode.as_str() {
            "verified" => {
                if self.license.path.as_os_str().is_empty() {
                    errors.push("verified licensing requires LICENSE_PATH".to_string());
                }
            }
            "unlicensed" => {}
            other => errors.push(format!(
                "LICENSE_MODE must be verified or unlicensed; got {other}"
            )),
        }

        if self.admin.username.is_empty() || self.admin.email.is_empty() {
            errors.push("ADMIN_USERNAME and ADMIN_MAIL are required".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    /// Separate signing key for job and upload tokens.
    pub job_secret: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "insecure-dev-secret".to_string(),
            job_secret: "insecure-dev-job-secret".to_string(),
        }
    }
}

impl SafeDisplay for JwtConfig {
    fn to_safe_string(&self) -> String {
        "secret: ****\njob secret: ****\n".to_string()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            email: "admin@localhost".to_string(),
            password: "password".to_string(),
        }
    }
}

impl SafeDisplay for AdminConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "username: {}", self.username);
        let _ = writeln!(&mut result, "email: {}", self.email);
        let _ = writeln!(&mut result, "password: ****");
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// `basic` or `keycloak`.
    pub provider: String,
    pub keycloak: KeycloakConfig,
    /// TTL of platform JWTs.
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            provider: "basic".to_string(),
            keycloak: KeycloakConfig::default(),
            token_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl SafeDisplay for IdentityConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "provider: {}", self.provider);
        if self.provider == "keycloak" {
            let _ = writeln!(&mut result, "keycloak:");
            let _ = writeln!(&mut result, "{}", self.keycloak.to_safe_string_indented());
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct KeycloakConfig {
    pub server_url: String,
    pub realm: String,
    pub admin_username: String,
    pub admin_password: String,
}

impl SafeDisplay for KeycloakConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "server url: {}", self.server_url);
        let _ = writeln!(&mut result, "realm: {}", self.realm);
        let _ = writeln!(&mut result, "admin username: {}", self.admin_username);
        let _ = writeln!(&mut result, "admin password: ****");
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub nomad_endpoint: Option<String>,
    pub nomad_token: Option<String>,
    pub datacenter: String,
    /// Set (to `1` or `true`) to target Kubernetes instead of Nomad.
    pub kubernetes: Option<String>,
    pub namespace: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl OrchestratorConfig {
    pub fn kubernetes_enabled(&self) -> bool {
        matches!(self.kubernetes.as_deref(), Some("1" | "true" | "yes"))
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            nomad_endpoint: None,
            nomad_token: None,
            datacenter: "dc1".to_string(),
            kubernetes: None,
            namespace: "model-bazaar".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SafeDisplay for OrchestratorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        if let Some(endpoint) = &self.nomad_endpoint {
            let _ = writeln!(&mut result, "nomad endpoint: {endpoint}");
            let _ = writeln!(&mut result, "nomad token: ****");
            let _ = writeln!(&mut result, "datacenter: {}", self.datacenter);
        }
        if self.kubernetes_enabled() {
            let _ = writeln!(&mut result, "kubernetes namespace: {}", self.namespace);
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverConfig {
    /// `docker` renders container jobs and relies on the orchestrator to
    /// diff; `local` executes scripts with an interpreter and forces a
    /// stop-before-start.
    pub mode: String,
    pub registry: String,
    pub image: String,
    pub tag: Option<String>,
    pub interpreter: PathBuf,
    pub scripts_dir: PathBuf,
}

impl DriverConfig {
    pub fn is_local(&self) -> bool {
        self.mode == "local"
    }

    pub fn docker_image(&self) -> String {
        format!(
            "{}/{}:{}",
            self.registry,
            self.image,
            self.tag.as_deref().unwrap_or("latest")
        )
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            mode: "local".to_string(),
            registry: "docker.io/modelbazaar".to_string(),
            image: "bazaar-jobs".to_string(),
            tag: None,
            interpreter: PathBuf::from("python3"),
            scripts_dir: PathBuf::from("/opt/bazaar/jobs"),
        }
    }
}

impl SafeDisplay for DriverConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "mode: {}", self.mode);
        if self.mode == "docker" {
            let _ = writeln!(&mut result, "image: {}", self.docker_image());
        } else {
            let _ = writeln!(&mut result, "interpreter: {}", self.interpreter.display());
            let _ = writeln!(&mut result, "scripts dir: {}", self.scripts_dir.display());
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LicenseConfig {
    /// `verified` or `unlicensed` (dev only).
    pub mode: String,
    pub path: PathBuf,
    pub public_key_pem: String,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            mode: "unlicensed".to_string(),
            path: PathBuf::new(),
            public_key_pem: String::new(),
        }
    }
}

impl SafeDisplay for LicenseConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "mode: {}", self.mode);
        if self.mode == "verified" {
            let _ = writeln!(&mut result, "path: {}", self.path.display());
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Consecutive `unknown` observations after which a job is declared
    /// failed.
    pub unknown_ticks_to_failure: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            unknown_ticks_to_failure: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub janitor_interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(24 * 60 * 60),
            janitor_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PlatformJobsConfig {
    pub skip_all: bool,
    pub skip_cache: bool,
    pub skip_dispatch: bool,
    pub skip_generation: bool,
    pub skip_telemetry: bool,
    pub skip_frontend: bool,
}

pub fn make_config_loader() -> ConfigLoader<BazaarConfig> {
    ConfigLoader::new_with_env_mappings(
        &PathBuf::from("config/bazaar-service.toml"),
        ENV_MAPPINGS,
    )
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn config_is_loadable() {
        let config = make_config_loader().load().expect("Failed to load config");
        // defaults alone fail validation: no orchestrator is selected
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_requires_exactly_one_orchestrator() {
        let mut config = BazaarConfig::default();
        config.orchestrator.nomad_endpoint = Some("http://nomad:4646".to_string());
        config.orchestrator.nomad_token = Some("token".to_string());
        config.orchestrator.kubernetes = Some("1".to_string());
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("mutually exclusive")));

        config.orchestrator.kubernetes = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_docker_without_tag() {
        let mut config = BazaarConfig::default();
        config.orchestrator.kubernetes = Some("1".to_string());
        config.driver.mode = "docker".to_string();
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("TAG")));

        config.driver.tag = Some("v1.2.3".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_keycloak_vars_with_basic_provider() {
        let mut config = BazaarConfig::default();
        config.orchestrator.kubernetes = Some("1".to_string());
        config.identity.keycloak.server_url = "http://keycloak:8180".to_string();
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("KEYCLOAK")));

        config.identity.provider = "keycloak".to_string();
        assert!(config.validate().is_ok());
    }
}
