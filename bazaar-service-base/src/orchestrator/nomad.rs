use super::{
    AllocationLogs, Job, JobDriver, JobInfo, JobState, Orchestrator, OrchestratorError,
    ServiceAllocation, ServiceEndpoints,
};
use async_trait::async_trait;
use minijinja::{context, Environment};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const BATCH_TEMPLATE: &str = include_str!("templates/nomad_batch.json.j2");
const SERVICE_TEMPLATE: &str = include_str!("templates/nomad_service.json.j2");

#[derive(Debug, Clone)]
pub struct NomadConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub datacenter: String,
    pub ingress_hostname: String,
    pub request_timeout: Duration,
}

/// Driver speaking the Nomad HTTP API. Job registration is create-or-update
/// on the Nomad side, which is what makes `start` idempotent.
pub struct NomadOrchestrator {
    config: NomadConfig,
    client: reqwest::Client,
    templates: Environment<'static>,
}

impl NomadOrchestrator {
    pub fn new(config: NomadConfig) -> Result<Self, OrchestratorError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        let mut templates = Environment::new();
        templates
            .add_template("batch", BATCH_TEMPLATE)
            .map_err(|e| OrchestratorError::InvalidJob(e.to_string()))?;
        templates
            .add_template("service", SERVICE_TEMPLATE)
            .map_err(|e| OrchestratorError::InvalidJob(e.to_string()))?;
        Ok(Self {
            config,
            client,
            templates,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.endpoint.trim_end_matches('/'))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => builder.header("X-Nomad-Token", token),
            None => builder,
        }
    }

    pub fn render(&self, job: &Job) -> Result<Value, OrchestratorError> {
        let (docker, image, interpreter, script) = match &job.driver {
            JobDriver::Docker { image } => (true, image.clone(), String::new(), String::new()),
            JobDriver::Local {
                interpreter,
                script,
            } => (
                false,
                String::new(),
                interpreter.to_string_lossy().to_string(),
                script.clone(),
            ),
        };
        let template = self
            .templates
            .get_template(job.template_id())
            .map_err(|e| OrchestratorError::InvalidJob(e.to_string()))?;
        let service = job.service.clone().unwrap_or(super::ServiceSpec {
            port: 0,
            ingress_path: String::new(),
            min_replicas: 1,
            max_replicas: 1,
            autoscaling_enabled: false,
        });
        let ingress_rule = format!(
            "traefik.http.routers.{}.rule=PathPrefix(`{}`)",
            job.name, service.ingress_path
        );
        let rendered = template
            .render(context! {
                name => job.name,
                datacenter => self.config.datacenter,
                docker => docker,
                image => image,
                interpreter => interpreter,
                script => script,
                args => job.args,
                env => job.env,
                cpu_mhz => job.resources.cpu_mhz,
                memory_mb => job.resources.memory_mb,
                memory_max_mb => job.resources.memory_max_mb,
                port => service.port,
                ingress_rule => ingress_rule,
                min_replicas => service.min_replicas,
                max_replicas => service.max_replicas,
                autoscaling_enabled => service.autoscaling_enabled,
            })
            .map_err(|e| OrchestratorError::InvalidJob(e.to_string()))?;
        serde_json::from_str(&rendered)
            .map_err(|e| OrchestratorError::InvalidJob(format!("rendered job is not JSON: {e}")))
    }

    async fn get_json(&self, path: &str) -> Result<Option<Value>, OrchestratorError> {
        let response = self.request(self.client.get(self.url(path))).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(OrchestratorError::from)?;
        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl Orchestrator for NomadOrchestrator {
    async fn start(&self, job: &Job) -> Result<(), OrchestratorError> {
        let payload = self.render(job)?;
        debug!(job = %job.name, "registering nomad job");
        self.request(self.client.post(self.url("/v1/jobs")))
            .json(&payload)
            .send()
            .await?
            .error_for_status()
            .map_err(OrchestratorError::from)?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), OrchestratorError> {
        let response = self
            .request(
                self.client
                    .delete(self.url(&format!("/v1/job/{name}?purge=true"))),
            )
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        response
            .error_for_status()
            .map_err(OrchestratorError::from)?;
        Ok(())
    }

    async fn info(&self, name: &str) -> Result<JobInfo, OrchestratorError> {
        let Some(body) = self.get_json(&format!("/v1/job/{name}")).await? else {
            return Ok(JobInfo {
                name: name.to_string(),
                state: JobState::Unknown,
            });
        };
        let state = match body["Status"].as_str() {
            Some("pending") => JobState::Pending,
            Some("running") => JobState::Running,
            Some("dead") => {
                // A dead batch job may have completed or failed; the summary
                // distinguishes the two.
                let failed = self
                    .get_json(&format!("/v1/job/{name}/summary"))
                    .await?
                    .and_then(|summary| {
                        summary["Summary"].as_object().map(|groups| {
                            groups
                                .values()
                                .any(|group| group["Failed"].as_u64().unwrap_or(0) > 0)
                        })
                    })
                    .unwrap_or(false);
                if failed {
                    JobState::Failed
                } else {
                    JobState::Dead
                }
            }
            _ => JobState::Unknown,
        };
        Ok(JobInfo {
            name: name.to_string(),
            state,
        })
    }

    async fn logs(&self, name: &str) -> Result<Vec<AllocationLogs>, OrchestratorError> {
        let Some(allocations) = self.get_json(&format!("/v1/job/{name}/allocations")).await?
        else {
            return Ok(vec![]);
        };
        let mut logs = Vec::new();
        for allocation in allocations.as_array().into_iter().flatten() {
            let Some(alloc_id) = allocation["ID"].as_str() else {
                continue;
            };
            let mut entry = AllocationLogs::default();
            for (kind, target) in [("stdout", &mut entry.stdout), ("stderr", &mut entry.stderr)] {
                let path = format!(
                    "/v1/client/fs/logs/{alloc_id}?task={name}&type={kind}&origin=end&offset=65536&plain=true"
                );
                // log fetches go through the client API and can fail while the
                // allocation is being placed; missing output is not an error
                if let Ok(response) = self.request(self.client.get(self.url(&path))).send().await {
                    if response.status().is_success() {
                        *target = response.text().await.unwrap_or_default();
                    }
                }
            }
            logs.push(entry);
        }
        Ok(logs)
    }

    async fn services(&self) -> Result<Vec<ServiceEndpoints>, OrchestratorError> {
        let Some(namespaces) = self.get_json("/v1/services").await? else {
            return Ok(vec![]);
        };
        let mut result = Vec::new();
        for namespace in namespaces.as_array().into_iter().flatten() {
            for service in namespace["Services"].as_array().into_iter().flatten() {
                let Some(service_name) = service["ServiceName"].as_str() else {
                    continue;
                };
                let Some(instances) = self
                    .get_json(&format!("/v1/service/{service_name}"))
                    .await?
                else {
                    continue;
                };
                let allocations = instances
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|instance| {
                        Some(ServiceAllocation {
                            address: instance["Address"].as_str()?.to_string(),
                            port: instance["Port"].as_u64()? as u16,
                            alloc_id: instance["AllocID"].as_str().unwrap_or("").to_string(),
                            node_id: instance["NodeID"].as_str().unwrap_or("").to_string(),
                        })
                    })
                    .collect();
                result.push(ServiceEndpoints {
                    name: service_name.to_string(),
                    allocations,
                });
            }
        }
        Ok(result)
    }

    async fn total_cpu_usage_mhz(&self) -> Result<u64, OrchestratorError> {
        let Some(allocations) = self.get_json("/v1/allocations?resources=true").await? else {
            return Ok(0);
        };
        let mut total = 0u64;
        for allocation in allocations.as_array().into_iter().flatten() {
            let status = allocation["ClientStatus"].as_str().unwrap_or("");
            if status != "running" && status != "pending" {
                continue;
            }
            let shares = allocation["AllocatedResources"]["Tasks"]
                .as_object()
                .map(|tasks| {
                    tasks
                        .values()
                        .filter_map(|task| task["Cpu"]["CpuShares"].as_u64())
                        .sum::<u64>()
                })
                .filter(|total| *total > 0)
                .unwrap_or_else(|| allocation["Resources"]["CPU"].as_u64().unwrap_or(0));
            total += shares;
        }
        Ok(total)
    }

    fn ingress_hostname(&self) -> String {
        self.config.ingress_hostname.clone()
    }

    fn name(&self) -> &'static str {
        "nomad"
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::orchestrator::{JobResources, ServiceSpec};
    use std::collections::BTreeMap;

    fn driver() -> NomadOrchestrator {
        NomadOrchestrator::new(NomadConfig {
            endpoint: "http://localhost:4646".to_string(),
            token: None,
            datacenter: "dc1".to_string(),
            ingress_hostname: "bazaar.example.com".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn batch_job() -> Job {
        let mut env = BTreeMap::new();
        env.insert("JOB_TOKEN".to_string(), "secret\"quoted".to_string());
        env.insert("CONFIG_PATH".to_string(), "models/x/train.json".to_string());
        Job {
            name: "train-abc".to_string(),
            driver: JobDriver::Docker {
                image: "registry.local/trainer:v1".to_string(),
            },
            env,
            args: vec!["--mode".to_string(), "train".to_string()],
            resources: JobResources {
                cpu_mhz: 2400,
                memory_mb: 4096,
                memory_max_mb: 8192,
                cores: 1,
            },
            service: None,
        }
    }

    #[test]
    fn batch_template_renders_valid_json() {
        let rendered = driver().render(&batch_job()).unwrap();
        assert_eq!(rendered["Job"]["ID"], "train-abc");
        assert_eq!(rendered["Job"]["Type"], "batch");
        let task = &rendered["Job"]["TaskGroups"][0]["Tasks"][0];
        assert_eq!(task["Driver"], "docker");
        assert_eq!(task["Config"]["image"], "registry.local/trainer:v1");
        assert_eq!(task["Env"]["JOB_TOKEN"], "secret\"quoted");
        assert_eq!(task["Resources"]["CPU"], 2400);
    }

    #[test]
    fn service_template_includes_scaling_and_ingress() {
        let mut job = batch_job();
        job.name = "deploy-abc".to_string();
        job.service = Some(ServiceSpec {
            port: 8501,
            ingress_path: "/my-model".to_string(),
            min_replicas: 1,
            max_replicas: 4,
            autoscaling_enabled: true,
        });
        let rendered = driver().render(&job).unwrap();
        let group = &rendered["Job"]["TaskGroups"][0];
        assert_eq!(rendered["Job"]["Type"], "service");
        assert_eq!(group["Scaling"]["Max"], 4);
        let tags = group["Services"][0]["Tags"].as_array().unwrap();
        assert!(tags
            .iter()
            .any(|t| t.as_str().unwrap().contains("PathPrefix(`/my-model`)")));
    }

    #[test]
    fn local_driver_renders_raw_exec() {
        let mut job = batch_job();
        job.driver = JobDriver::Local {
            interpreter: "/usr/bin/python3".into(),
            script: "train.py".to_string(),
        };
        let rendered = driver().render(&job).unwrap();
        let task = &rendered["Job"]["TaskGroups"][0]["Tasks"][0];
        assert_eq!(task["Driver"], "raw_exec");
        assert_eq!(task["Config"]["command"], "/usr/bin/python3");
        assert_eq!(task["Config"]["args"][0], "train.py");
    }
}
