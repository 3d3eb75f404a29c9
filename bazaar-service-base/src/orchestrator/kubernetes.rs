use super::{
    AllocationLogs, Job, JobDriver, JobInfo, JobState, Orchestrator, OrchestratorError,
    ServiceAllocation, ServiceEndpoints, MHZ_PER_CORE,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job as BatchJob;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service as KubeService};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Value};
use tracing::debug;

const FIELD_MANAGER: &str = "model-bazaar";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub namespace: String,
    pub ingress_hostname: String,
}

/// Driver building typed Kubernetes resources and applying them with
/// server-side apply, so create-or-update and partial-failure healing are
/// delegated to the apiserver.
pub struct KubernetesOrchestrator {
    client: Client,
    config: KubernetesConfig,
}

impl KubernetesOrchestrator {
    pub async fn new(config: KubernetesConfig) -> Result<Self, OrchestratorError> {
        let client = Client::try_default().await?;
        Ok(Self { client, config })
    }

    pub fn with_client(client: Client, config: KubernetesConfig) -> Self {
        Self { client, config }
    }

    fn image_of(job: &Job) -> Result<&str, OrchestratorError> {
        match &job.driver {
            JobDriver::Docker { image } => Ok(image),
            JobDriver::Local { .. } => Err(OrchestratorError::InvalidJob(format!(
                "job {}: local exec driver is not available on kubernetes",
                job.name
            ))),
        }
    }

    fn pod_spec(job: &Job, image: &str, restart_policy: &str) -> Value {
        let env: Vec<Value> = job
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        let ports = job
            .service
            .as_ref()
            .map(|s| json!([{ "containerPort": s.port }]))
            .unwrap_or_else(|| json!([]));
        json!({
            "metadata": {
                "labels": { "app": job.name, MANAGED_BY_LABEL: FIELD_MANAGER }
            },
            "spec": {
                "restartPolicy": restart_policy,
                "containers": [{
                    "name": job.name,
                    "image": image,
                    "args": job.args,
                    "env": env,
                    "ports": ports,
                    "resources": {
                        "requests": {
                            "cpu": format!("{}m", job.resources.cores * 1000),
                            "memory": format!("{}Mi", job.resources.memory_mb)
                        },
                        "limits": {
                            "memory": format!("{}Mi", job.resources.memory_max_mb)
                        }
                    }
                }]
            }
        })
    }

    fn deployment(&self, job: &Job) -> Result<Deployment, OrchestratorError> {
        let image = Self::image_of(job)?;
        let service = job.service.as_ref().ok_or_else(|| {
            OrchestratorError::InvalidJob(format!("job {}: deployment without service", job.name))
        })?;
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": job.name,
                "labels": { "app": job.name, MANAGED_BY_LABEL: FIELD_MANAGER }
            },
            "spec": {
                "replicas": service.min_replicas,
                "selector": { "matchLabels": { "app": job.name } },
                "template": Self::pod_spec(job, image, "Always")
            }
        }))
        .map_err(|e| OrchestratorError::InvalidJob(e.to_string()))
    }

    fn service(&self, job: &Job) -> Result<KubeService, OrchestratorError> {
        let service = job.service.as_ref().ok_or_else(|| {
            OrchestratorError::InvalidJob(format!("job {}: missing service spec", job.name))
        })?;
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": job.name,
                "labels": { "app": job.name, MANAGED_BY_LABEL: FIELD_MANAGER }
            },
            "spec": {
                "selector": { "app": job.name },
                "ports": [{ "port": 80, "targetPort": service.port }]
            }
        }))
        .map_err(|e| OrchestratorError::InvalidJob(e.to_string()))
    }

    fn ingress(&self, job: &Job) -> Result<Ingress, OrchestratorError> {
        let service = job.service.as_ref().ok_or_else(|| {
            OrchestratorError::InvalidJob(format!("job {}: missing service spec", job.name))
        })?;
        serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {
                "name": job.name,
                "labels": { "app": job.name, MANAGED_BY_LABEL: FIELD_MANAGER }
            },
            "spec": {
                "rules": [{
                    "host": self.config.ingress_hostname,
                    "http": {
                        "paths": [{
                            "path": service.ingress_path,
                            "pathType": "Prefix",
                            "backend": {
                                "service": { "name": job.name, "port": { "number": 80 } }
                            }
                        }]
                    }
                }]
            }
        }))
        .map_err(|e| OrchestratorError::InvalidJob(e.to_string()))
    }

    fn autoscaler(&self, job: &Job) -> Result<HorizontalPodAutoscaler, OrchestratorError> {
        let service = job.service.as_ref().ok_or_else(|| {
            OrchestratorError::InvalidJob(format!("job {}: missing service spec", job.name))
        })?;
        serde_json::from_value(json!({
            "apiVersion": "autoscaling/v2",
            "kind": "HorizontalPodAutoscaler",
            "metadata": {
                "name": job.name,
                "labels": { "app": job.name, MANAGED_BY_LABEL: FIELD_MANAGER }
            },
            "spec": {
                "scaleTargetRef": {
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "name": job.name
                },
                "minReplicas": service.min_replicas,
                "maxReplicas": service.max_replicas,
                "metrics": [{
                    "type": "Resource",
                    "resource": {
                        "name": "cpu",
                        "target": { "type": "Utilization", "averageUtilization": 80 }
                    }
                }]
            }
        }))
        .map_err(|e| OrchestratorError::InvalidJob(e.to_string()))
    }

    fn batch_job(&self, job: &Job) -> Result<BatchJob, OrchestratorError> {
        let image = Self::image_of(job)?;
        serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": job.name,
                "labels": { "app": job.name, MANAGED_BY_LABEL: FIELD_MANAGER }
            },
            "spec": {
                "backoffLimit": 0,
                "template": Self::pod_spec(job, image, "Never")
            }
        }))
        .map_err(|e| OrchestratorError::InvalidJob(e.to_string()))
    }

    async fn apply<K>(&self, name: &str, resource: &K) -> Result<(), OrchestratorError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::Serialize
            + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &self.config.namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(resource),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    async fn start(&self, job: &Job) -> Result<(), OrchestratorError> {
        if job.service.is_some() {
            debug!(job = %job.name, "applying kubernetes deployment stack");
            self.apply(&job.name, &self.deployment(job)?).await?;
            self.apply(&job.name, &self.service(job)?).await?;
            self.apply(&job.name, &self.ingress(job)?).await?;
            if job
                .service
                .as_ref()
                .map(|s| s.autoscaling_enabled)
                .unwrap_or(false)
            {
                self.apply(&job.name, &self.autoscaler(job)?).await?;
            }
        } else {
            // batch job specs are immutable; replace instead of patching
            let api: Api<BatchJob> = Api::namespaced(self.client.clone(), &self.config.namespace);
            match api.delete(&job.name, &DeleteParams::background()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
            api.create(&PostParams::default(), &self.batch_job(job)?)
                .await?;
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), OrchestratorError> {
        macro_rules! delete {
            ($kind:ty) => {{
                let api: Api<$kind> = Api::namespaced(self.client.clone(), &self.config.namespace);
                match api.delete(name, &DeleteParams::background()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }};
        }
        delete!(BatchJob);
        delete!(HorizontalPodAutoscaler);
        delete!(Ingress);
        delete!(KubeService);
        delete!(Deployment);
        Ok(())
    }

    async fn info(&self, name: &str) -> Result<JobInfo, OrchestratorError> {
        let jobs: Api<BatchJob> = Api::namespaced(self.client.clone(), &self.config.namespace);
        if let Some(job) = jobs.get_opt(name).await? {
            let status = job.status.unwrap_or_default();
            let failed = status
                .conditions
                .iter()
                .flatten()
                .any(|c| c.type_ == "Failed" && c.status == "True");
            let complete = status
                .conditions
                .iter()
                .flatten()
                .any(|c| c.type_ == "Complete" && c.status == "True");
            let state = if failed {
                JobState::Failed
            } else if complete {
                JobState::Dead
            } else if status.active.unwrap_or(0) > 0 {
                JobState::Running
            } else {
                JobState::Pending
            };
            return Ok(JobInfo {
                name: name.to_string(),
                state,
            });
        }

        let deployments: Api<Deployment> =
            Api::namespaced(self.client.clone(), &self.config.namespace);
        if let Some(deployment) = deployments.get_opt(name).await? {
            let available = deployment
                .status
                .and_then(|s| s.available_replicas)
                .unwrap_or(0);
            let state = if available > 0 {
                JobState::Running
            } else {
                JobState::Pending
            };
            return Ok(JobInfo {
                name: name.to_string(),
                state,
            });
        }

        Ok(JobInfo {
            name: name.to_string(),
            state: JobState::Unknown,
        })
    }

    async fn logs(&self, name: &str) -> Result<Vec<AllocationLogs>, OrchestratorError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let list = pods
            .list(&ListParams::default().labels(&format!("app={name}")))
            .await?;
        let mut logs = Vec::new();
        for pod in list.items {
            let Some(pod_name) = pod.metadata.name else {
                continue;
            };
            let params = LogParams {
                tail_lines: Some(1000),
                ..Default::default()
            };
            // kubernetes merges both streams into one log
            let stdout = pods.logs(&pod_name, &params).await.unwrap_or_default();
            logs.push(AllocationLogs {
                stdout,
                stderr: String::new(),
            });
        }
        Ok(logs)
    }

    async fn services(&self) -> Result<Vec<ServiceEndpoints>, OrchestratorError> {
        let services: Api<KubeService> =
            Api::namespaced(self.client.clone(), &self.config.namespace);
        let endpoints: Api<Endpoints> =
            Api::namespaced(self.client.clone(), &self.config.namespace);
        let list = services
            .list(&ListParams::default().labels(&format!("{MANAGED_BY_LABEL}={FIELD_MANAGER}")))
            .await?;
        let mut result = Vec::new();
        for service in list.items {
            let Some(service_name) = service.metadata.name else {
                continue;
            };
            let mut allocations = Vec::new();
            if let Some(endpoint) = endpoints.get_opt(&service_name).await? {
                for subset in endpoint.subsets.into_iter().flatten() {
                    let ports: Vec<u16> = subset
                        .ports
                        .iter()
                        .flatten()
                        .map(|p| p.port as u16)
                        .collect();
                    for address in subset.addresses.into_iter().flatten() {
                        for port in &ports {
                            allocations.push(ServiceAllocation {
                                address: address.ip.clone(),
                                port: *port,
                                alloc_id: address
                                    .target_ref
                                    .as_ref()
                                    .and_then(|r| r.name.clone())
                                    .unwrap_or_default(),
                                node_id: address.node_name.clone().unwrap_or_default(),
                            });
                        }
                    }
                }
            }
            result.push(ServiceEndpoints {
                name: service_name,
                allocations,
            });
        }
        Ok(result)
    }

    async fn total_cpu_usage_mhz(&self) -> Result<u64, OrchestratorError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let list = pods.list(&ListParams::default()).await?;
        let mut millicores = 0u64;
        for pod in list.items {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            if phase != "Running" && phase != "Pending" {
                continue;
            }
            for container in pod.spec.iter().flat_map(|s| s.containers.iter()) {
                let cpu = container
                    .resources
                    .as_ref()
                    .and_then(|r| r.requests.as_ref())
                    .and_then(|requests| requests.get("cpu"))
                    .map(|quantity| parse_cpu_millicores(&quantity.0))
                    .unwrap_or(0);
                millicores += cpu;
            }
        }
        Ok(millicores * MHZ_PER_CORE / 1000)
    }

    fn ingress_hostname(&self) -> String {
        self.config.ingress_hostname.clone()
    }

    fn name(&self) -> &'static str {
        "kubernetes"
    }
}

/// Parses a Kubernetes CPU quantity (`"2"`, `"0.5"`, `"500m"`) into
/// millicores.
pub fn parse_cpu_millicores(quantity: &str) -> u64 {
    if let Some(millis) = quantity.strip_suffix('m') {
        millis.parse::<u64>().unwrap_or(0)
    } else {
        quantity
            .parse::<f64>()
            .map(|cores| (cores * 1000.0) as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn cpu_quantity_parsing() {
        assert_eq!(parse_cpu_millicores("500m"), 500);
        assert_eq!(parse_cpu_millicores("2"), 2000);
        assert_eq!(parse_cpu_millicores("0.5"), 500);
        assert_eq!(parse_cpu_millicores("garbage"), 0);
    }
}
