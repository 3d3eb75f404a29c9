pub mod platform;

use crate::config::DriverConfig;
use crate::model::{JobOptionsRequest, Model};
use crate::service::license::{LicenseError, LicenseGrant, LicenseService};
use crate::service::token::TokenService;
use bazaar_common::model::ModelId;
use bazaar_common::SafeDisplay;
use bazaar_service_base::orchestrator::{
    Job, JobDriver, JobResources, Orchestrator, OrchestratorError, ServiceSpec, MHZ_PER_CORE,
};
use bazaar_service_base::storage::{SharedStorage, StorageError};
use chrono::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_CORES: u64 = 2;
pub const DEFAULT_MEMORY_MB: u64 = 4096;
pub const DEPLOY_PORT: u16 = 8000;
/// Job tokens must outlive the longest plausible training run.
const JOB_TOKEN_TTL_HOURS: i64 = 72;

// --- shared storage layout -------------------------------------------------

pub fn model_prefix(id: &ModelId) -> String {
    format!("models/{id}")
}

pub fn train_config_path(id: &ModelId) -> String {
    format!("models/{id}/train_config.json")
}

pub fn deploy_config_path(id: &ModelId) -> String {
    format!("models/{id}/deploy_config.json")
}

pub fn data_prefix(upload_id: &bazaar_common::model::UploadId) -> String {
    format!("data/{upload_id}")
}

pub fn upload_chunk_prefix(upload_id: &bazaar_common::model::UploadId) -> String {
    format!("uploads/{upload_id}")
}

pub fn train_log_path(id: &ModelId) -> String {
    format!("logs/{id}/train.log")
}

pub fn deployment_log_path(id: &ModelId) -> String {
    format!("logs/{id}/deployment.log")
}

pub fn train_report_path(id: &ModelId) -> String {
    format!("models/{id}/report.json")
}

// --- job naming ------------------------------------------------------------

pub fn train_job_name(id: &ModelId) -> String {
    format!("train-{id}")
}

pub fn deploy_job_name(id: &ModelId) -> String {
    format!("deploy-{id}")
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    License(#[from] LicenseError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("job token error: {0}")]
    Token(String),
}

impl SafeDisplay for LaunchError {
    fn to_safe_string(&self) -> String {
        match self {
            LaunchError::License(inner) => inner.to_safe_string(),
            LaunchError::Orchestrator(inner) => inner.to_safe_string(),
            LaunchError::Storage(inner) => inner.to_safe_string(),
            LaunchError::Token(_) => "internal token error".to_string(),
        }
    }
}

/// Settings of one deployment rollout, resolved from the request body and
/// the model row.
#[derive(Debug, Clone)]
pub struct DeploySettings {
    pub ingress_path: String,
    pub autoscaling_enabled: bool,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub memory_mb: Option<u64>,
}

/// Builds descriptors for train, deploy and platform jobs: resources from
/// the request with defaults applied, a license check against current
/// cluster load, a job token in the environment and a config artifact on
/// shared storage.
pub struct JobLauncher {
    orchestrator: Arc<dyn Orchestrator>,
    storage: Arc<dyn SharedStorage>,
    license: Arc<LicenseService>,
    tokens: Arc<TokenService>,
    driver: DriverConfig,
    public_endpoint: String,
}

impl JobLauncher {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        storage: Arc<dyn SharedStorage>,
        license: Arc<LicenseService>,
        tokens: Arc<TokenService>,
        driver: DriverConfig,
        public_endpoint: String,
    ) -> Self {
        Self {
            orchestrator,
            storage,
            license,
            tokens,
            driver,
            public_endpoint,
        }
    }

    pub fn resources(options: &JobOptionsRequest) -> JobResources {
        let cores = options.allocation_cores.unwrap_or(DEFAULT_CORES).max(1);
        let memory_mb = options.allocation_memory_mb.unwrap_or(DEFAULT_MEMORY_MB);
        let memory_max_mb = options
            .allocation_memory_max_mb
            .unwrap_or(memory_mb * 2)
            .max(memory_mb);
        JobResources {
            cpu_mhz: cores * MHZ_PER_CORE,
            memory_mb,
            memory_max_mb,
            cores,
        }
    }

    fn job_driver(&self, script: &str) -> JobDriver {
        if self.driver.is_local() {
            JobDriver::Local {
                interpreter: self.driver.interpreter.clone(),
                script: self
                    .driver
                    .scripts_dir
                    .join(script)
                    .to_string_lossy()
                    .to_string(),
            }
        } else {
            JobDriver::Docker {
                image: self.driver.docker_image(),
            }
        }
    }

    /// License check with the incremental load of the job about to start.
    async fn preflight(&self, resources: &JobResources) -> Result<LicenseGrant, LaunchError> {
        let current = self.orchestrator.total_cpu_usage_mhz().await?;
        Ok(self.license.verify(current + resources.cpu_mhz)?)
    }

    fn base_env(
        &self,
        model_id: &ModelId,
        config_path: &str,
        grant: &LicenseGrant,
    ) -> Result<BTreeMap<String, String>, LaunchError> {
        let token = self
            .tokens
            .issue_job(*model_id, Duration::hours(JOB_TOKEN_TTL_HOURS))
            .map_err(|e| LaunchError::Token(e.to_string()))?;
        let mut env = BTreeMap::new();
        env.insert(
            "MODEL_BAZAAR_ENDPOINT".to_string(),
            self.public_endpoint.clone(),
        );
        env.insert("JOB_TOKEN".to_string(), token);
        env.insert("CONFIG_PATH".to_string(), config_path.to_string());
        env.insert("SHARE_LOCATION".to_string(), self.storage.location());
        env.insert("MODEL_ID".to_string(), model_id.to_string());
        env.insert(
            "BOLT_LICENSE_KEY".to_string(),
            grant.bolt_license_key.clone(),
        );
        Ok(env)
    }

    /// Local jobs are stopped first to force a re-render; docker jobs rely
    /// on the orchestrator diffing the descriptor.
    async fn start(&self, job: &Job) -> Result<(), LaunchError> {
        if job.driver.is_local() {
            self.orchestrator.stop(&job.name).await?;
        }
        self.orchestrator.start(job).await?;
        Ok(())
    }

    pub async fn launch_train_job(
        &self,
        model: &Model,
        config: &serde_json::Value,
        options: &JobOptionsRequest,
    ) -> Result<(), LaunchError> {
        let resources = Self::resources(options);
        let grant = self.preflight(&resources).await?;

        let config_path = train_config_path(&model.id);
        let rendered = serde_json::to_vec_pretty(config)
            .map_err(|e| LaunchError::Token(e.to_string()))?;
        self.storage.write(&config_path, &rendered).await?;

        let env = self.base_env(&model.id, &config_path, &grant)?;
        let job = Job {
            name: train_job_name(&model.id),
            driver: self.job_driver("train.py"),
            env,
            args: vec!["train".to_string()],
            resources,
            service: None,
        };
        info!(model_id = %model.id, job = %job.name, "launching training job");
        self.start(&job).await
    }

    pub async fn launch_deploy_job(
        &self,
        model: &Model,
        settings: &DeploySettings,
    ) -> Result<(), LaunchError> {
        let options = JobOptionsRequest {
            allocation_memory_mb: settings.memory_mb,
            ..Default::default()
        };
        let resources = Self::resources(&options);
        let grant = self.preflight(&resources).await?;

        let config_path = deploy_config_path(&model.id);
        let config = serde_json::json!({
            "model_id": model.id,
            "model_type": model.model_type,
            "model_prefix": model_prefix(&model.id),
            "ingress_path": settings.ingress_path,
        });
        self.storage
            .write(&config_path, &serde_json::to_vec_pretty(&config).unwrap_or_default())
            .await?;

        let env = self.base_env(&model.id, &config_path, &grant)?;
        let job = Job {
            name: deploy_job_name(&model.id),
            driver: self.job_driver("deploy.py"),
            env,
            args: vec!["deploy".to_string()],
            resources,
            service: Some(ServiceSpec {
                port: DEPLOY_PORT,
                ingress_path: settings.ingress_path.clone(),
                min_replicas: settings.min_replicas,
                max_replicas: settings.max_replicas,
                autoscaling_enabled: settings.autoscaling_enabled,
            }),
        };
        info!(model_id = %model.id, job = %job.name, "launching deployment");
        self.start(&job).await
    }

    pub async fn stop_job(&self, name: &str) -> Result<(), LaunchError> {
        self.orchestrator.stop(name).await?;
        Ok(())
    }

    pub fn ingress_url(&self, ingress_path: &str) -> String {
        format!(
            "https://{}{}",
            self.orchestrator.ingress_hostname(),
            ingress_path
        )
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn resources_apply_defaults() {
        let resources = JobLauncher::resources(&JobOptionsRequest::default());
        assert_eq!(resources.cores, DEFAULT_CORES);
        assert_eq!(resources.memory_mb, DEFAULT_MEMORY_MB);
        assert_eq!(resources.memory_max_mb, DEFAULT_MEMORY_MB * 2);
        assert_eq!(resources.cpu_mhz, DEFAULT_CORES * MHZ_PER_CORE);
    }

    #[test]
    fn resources_honor_explicit_options() {
        let resources = JobLauncher::resources(&JobOptionsRequest {
            allocation_cores: Some(8),
            allocation_memory_mb: Some(16384),
            allocation_memory_max_mb: Some(10000),
        });
        assert_eq!(resources.cores, 8);
        assert_eq!(resources.memory_mb, 16384);
        // the max allocation can never undercut the requested allocation
        assert_eq!(resources.memory_max_mb, 16384);
    }

    #[test]
    fn job_names_are_stable() {
        let id = ModelId::new_v4();
        assert_eq!(train_job_name(&id), format!("train-{id}"));
        assert_eq!(deploy_job_name(&id), format!("deploy-{id}"));
        assert_eq!(model_prefix(&id), format!("models/{id}"));
    }
}
