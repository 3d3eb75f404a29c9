use super::{JobLauncher, LaunchError};
use crate::config::PlatformJobsConfig;
use bazaar_common::model::ModelId;
use bazaar_service_base::orchestrator::{Job, ServiceSpec};
use bazaar_service_base::storage::SharedStorage;
use chrono::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const PROMETHEUS_CONFIG_PATH: &str = "cluster-monitoring/prometheus.yml";
pub const GRAFANA_DATASOURCE_PATH: &str = "cluster-monitoring/grafana-datasource.yml";
pub const GENAI_WEIGHTS_PREFIX: &str = "pretrained-models/genai";

struct PlatformJobSpec {
    name: &'static str,
    script: &'static str,
    port: u16,
    ingress_path: &'static str,
    skipped: bool,
}

/// Long-lived singleton jobs the control plane (re)starts on boot: LLM
/// cache, LLM dispatch, on-prem generation, telemetry and the frontend.
/// Platform jobs are exempt from the license CPU check.
pub struct PlatformJobs {
    launcher: Arc<JobLauncher>,
    storage: Arc<dyn SharedStorage>,
    config: PlatformJobsConfig,
    public_endpoint: String,
    grafana_db_url: Option<String>,
}

impl PlatformJobs {
    pub fn new(
        launcher: Arc<JobLauncher>,
        storage: Arc<dyn SharedStorage>,
        config: PlatformJobsConfig,
        public_endpoint: String,
        grafana_db_url: Option<String>,
    ) -> Self {
        Self {
            launcher,
            storage,
            config,
            public_endpoint,
            grafana_db_url,
        }
    }

    pub async fn start_all(&self) -> Result<(), LaunchError> {
        if self.config.skip_all {
            info!("skipping all platform jobs");
            return Ok(());
        }

        let specs = [
            PlatformJobSpec {
                name: "llm-cache",
                script: "llm_cache.py",
                port: 8900,
                ingress_path: "/cache",
                skipped: self.config.skip_cache,
            },
            PlatformJobSpec {
                name: "llm-dispatch",
                script: "llm_dispatch.py",
                port: 8901,
                ingress_path: "/llm-dispatch",
                skipped: self.config.skip_dispatch,
            },
            PlatformJobSpec {
                name: "on-prem-generation",
                script: "generation.py",
                port: 8902,
                ingress_path: "/on-prem-llm",
                skipped: self.config.skip_generation,
            },
            PlatformJobSpec {
                name: "telemetry",
                script: "telemetry.py",
                port: 9090,
                ingress_path: "/telemetry",
                skipped: self.config.skip_telemetry,
            },
            PlatformJobSpec {
                name: "frontend",
                script: "frontend.py",
                port: 80,
                ingress_path: "/",
                skipped: self.config.skip_frontend,
            },
        ];

        for spec in specs {
            if spec.skipped {
                info!(job = spec.name, "platform job skipped");
                continue;
            }
            if spec.name == "telemetry" {
                self.render_telemetry_configs().await?;
            }
            self.start_platform_job(&spec).await?;
        }
        Ok(())
    }

    async fn start_platform_job(&self, spec: &PlatformJobSpec) -> Result<(), LaunchError> {
        let mut env = BTreeMap::new();
        env.insert(
            "MODEL_BAZAAR_ENDPOINT".to_string(),
            self.public_endpoint.clone(),
        );
        env.insert("SHARE_LOCATION".to_string(), self.storage.location());
        match spec.name {
            "on-prem-generation" => {
                env.insert(
                    "GENAI_WEIGHTS_PREFIX".to_string(),
                    GENAI_WEIGHTS_PREFIX.to_string(),
                );
            }
            "llm-dispatch" => {
                // dispatch reports usage back through the job callbacks
                let token = self
                    .launcher
                    .tokens
                    .issue_job(ModelId(Uuid::nil()), Duration::days(365))
                    .map_err(|e| LaunchError::Token(e.to_string()))?;
                env.insert("JOB_TOKEN".to_string(), token);
            }
            "telemetry" => {
                env.insert(
                    "PROMETHEUS_CONFIG_PATH".to_string(),
                    PROMETHEUS_CONFIG_PATH.to_string(),
                );
            }
            _ => {}
        }

        let job = Job {
            name: spec.name.to_string(),
            driver: self.launcher.job_driver(spec.script),
            env,
            args: vec![],
            resources: JobLauncher::resources(&Default::default()),
            service: Some(ServiceSpec {
                port: spec.port,
                ingress_path: spec.ingress_path.to_string(),
                min_replicas: 1,
                max_replicas: 1,
                autoscaling_enabled: false,
            }),
        };
        info!(job = spec.name, "starting platform job");
        self.launcher.start(&job).await
    }

    /// Prometheus discovers deployment targets through the control plane's
    /// HTTP-SD endpoint; the rendered config is written to shared storage
    /// where the telemetry job reads it.
    async fn render_telemetry_configs(&self) -> Result<(), LaunchError> {
        let prometheus = format!(
            r#"global:
  scrape_interval: 15s
scrape_configs:
  - job_name: model-bazaar-deployments
    http_sd_configs:
      - url: {}/api/v2/telemetry/deployment-services
        refresh_interval: 30s
"#,
            self.public_endpoint.trim_end_matches('/')
        );
        self.storage
            .write(PROMETHEUS_CONFIG_PATH, prometheus.as_bytes())
            .await?;

        if let Some(grafana_db_url) = &self.grafana_db_url {
            let datasource = format!(
                r#"apiVersion: 1
datasources:
  - name: bazaar-postgres
    type: postgres
    url: {grafana_db_url}
    isDefault: true
"#
            );
            self.storage
                .write(GRAFANA_DATASOURCE_PATH, datasource.as_bytes())
                .await?;
        }
        Ok(())
    }
}
