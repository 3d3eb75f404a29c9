pub mod kubernetes;
pub mod memory;
pub mod nomad;

use async_trait::async_trait;
use bazaar_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Nominal clock speed used to convert between Kubernetes millicores and the
/// MHz-denominated CPU accounting of the licensing layer.
pub const MHZ_PER_CORE: u64 = 2400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobDriver {
    /// Container image, fully qualified (`registry/name:tag`).
    Docker { image: String },
    /// Development driver executing a script with a local interpreter.
    Local { interpreter: PathBuf, script: String },
}

impl JobDriver {
    pub fn is_local(&self) -> bool {
        matches!(self, JobDriver::Local { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResources {
    pub cpu_mhz: u64,
    pub memory_mb: u64,
    pub memory_max_mb: u64,
    pub cores: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub port: u16,
    /// Path under the ingress hostname the service is exposed at.
    pub ingress_path: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub autoscaling_enabled: bool,
}

/// Orchestrator-agnostic job descriptor. Passed by value to drivers which
/// render it into their native representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub driver: JobDriver,
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
    pub resources: JobResources,
    /// Present for long-lived deployments; absent for batch jobs.
    pub service: Option<ServiceSpec>,
}

impl Job {
    pub fn template_id(&self) -> &'static str {
        if self.service.is_some() {
            "service"
        } else {
            "batch"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Dead,
    Failed,
    Unknown,
}

impl JobState {
    pub fn is_gone(&self) -> bool {
        matches!(self, JobState::Dead | JobState::Failed)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Dead => "dead",
            JobState::Failed => "failed",
            JobState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub name: String,
    pub state: JobState,
}

/// Captured output of one allocation or pod of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationLogs {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAllocation {
    pub address: String,
    pub port: u16,
    pub alloc_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoints {
    pub name: String,
    pub allocations: Vec<ServiceAllocation>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator request failed: {0}")]
    Transient(String),
    #[error("invalid job descriptor: {0}")]
    InvalidJob(String),
}

impl SafeDisplay for OrchestratorError {
    fn to_safe_string(&self) -> String {
        match self {
            OrchestratorError::Transient(_) => "cluster orchestrator unavailable".to_string(),
            OrchestratorError::InvalidJob(_) => self.to_string(),
        }
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(error: reqwest::Error) -> Self {
        OrchestratorError::Transient(error.to_string())
    }
}

impl From<kube::Error> for OrchestratorError {
    fn from(error: kube::Error) -> Self {
        OrchestratorError::Transient(error.to_string())
    }
}

/// One cluster scheduler. The control plane is the only mutator of jobs;
/// `start` must be idempotent so callers can blindly retry.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create-or-update. Starting an unchanged job is a no-op; a changed
    /// descriptor replaces the running job. Partial earlier failures are
    /// healed by re-running the missing subset.
    async fn start(&self, job: &Job) -> Result<(), OrchestratorError>;

    /// Tears down everything associated with the name; succeeds when nothing
    /// exists.
    async fn stop(&self, name: &str) -> Result<(), OrchestratorError>;

    async fn info(&self, name: &str) -> Result<JobInfo, OrchestratorError>;

    async fn logs(&self, name: &str) -> Result<Vec<AllocationLogs>, OrchestratorError>;

    /// Currently running deployment endpoints, for service discovery.
    async fn services(&self) -> Result<Vec<ServiceEndpoints>, OrchestratorError>;

    /// Requested CPU summed across all scheduled workloads.
    async fn total_cpu_usage_mhz(&self) -> Result<u64, OrchestratorError>;

    fn ingress_hostname(&self) -> String;

    fn name(&self) -> &'static str;
}
