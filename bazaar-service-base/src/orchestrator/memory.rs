use super::{
    AllocationLogs, Job, JobInfo, JobState, Orchestrator, OrchestratorError, ServiceAllocation,
    ServiceEndpoints,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Records jobs instead of scheduling them; states are scripted by tests and
/// the reconciler observes them exactly like real cluster state.
#[derive(Default)]
pub struct InMemoryOrchestrator {
    jobs: Mutex<HashMap<String, (Job, JobState)>>,
    ingress_hostname: String,
}

impl InMemoryOrchestrator {
    pub fn new(ingress_hostname: impl Into<String>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            ingress_hostname: ingress_hostname.into(),
        }
    }

    pub fn set_state(&self, name: &str, state: JobState) {
        if let Some(entry) = self.jobs.lock().get_mut(name) {
            entry.1 = state;
        }
    }

    pub fn remove(&self, name: &str) {
        self.jobs.lock().remove(name);
    }

    pub fn started_jobs(&self) -> Vec<Job> {
        self.jobs.lock().values().map(|(job, _)| job.clone()).collect()
    }

    pub fn job(&self, name: &str) -> Option<Job> {
        self.jobs.lock().get(name).map(|(job, _)| job.clone())
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn start(&self, job: &Job) -> Result<(), OrchestratorError> {
        let mut jobs = self.jobs.lock();
        match jobs.get(&job.name) {
            Some((existing, _)) if existing == job => {}
            _ => {
                jobs.insert(job.name.clone(), (job.clone(), JobState::Running));
            }
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), OrchestratorError> {
        self.jobs.lock().remove(name);
        Ok(())
    }

    async fn info(&self, name: &str) -> Result<JobInfo, OrchestratorError> {
        let state = self
            .jobs
            .lock()
            .get(name)
            .map(|(_, state)| *state)
            .unwrap_or(JobState::Unknown);
        Ok(JobInfo {
            name: name.to_string(),
            state,
        })
    }

    async fn logs(&self, _name: &str) -> Result<Vec<AllocationLogs>, OrchestratorError> {
        Ok(vec![])
    }

    async fn services(&self) -> Result<Vec<ServiceEndpoints>, OrchestratorError> {
        let jobs = self.jobs.lock();
        Ok(jobs
            .iter()
            .filter(|(_, (job, state))| job.service.is_some() && *state == JobState::Running)
            .map(|(name, (job, _))| ServiceEndpoints {
                name: name.clone(),
                allocations: vec![ServiceAllocation {
                    address: "127.0.0.1".to_string(),
                    port: job.service.as_ref().map(|s| s.port).unwrap_or(0),
                    alloc_id: format!("{name}-0"),
                    node_id: "local".to_string(),
                }],
            })
            .collect())
    }

    async fn total_cpu_usage_mhz(&self) -> Result<u64, OrchestratorError> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|(_, state)| matches!(state, JobState::Running | JobState::Pending))
            .map(|(job, _)| job.resources.cpu_mhz)
            .sum())
    }

    fn ingress_hostname(&self) -> String {
        self.ingress_hostname.clone()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::orchestrator::{JobDriver, JobResources};
    use std::collections::BTreeMap;

    fn job(name: &str) -> Job {
        Job {
            name: name.to_string(),
            driver: JobDriver::Docker {
                image: "img:latest".to_string(),
            },
            env: BTreeMap::new(),
            args: vec![],
            resources: JobResources {
                cpu_mhz: 1000,
                memory_mb: 512,
                memory_max_mb: 1024,
                cores: 1,
            },
            service: None,
        }
    }

    #[test]
    async fn start_is_idempotent_for_unchanged_descriptors() {
        let orchestrator = InMemoryOrchestrator::new("localhost");
        orchestrator.start(&job("a")).await.unwrap();
        orchestrator.set_state("a", JobState::Dead);
        // same descriptor: no-op, the dead state is preserved
        orchestrator.start(&job("a")).await.unwrap();
        assert_eq!(
            orchestrator.info("a").await.unwrap().state,
            JobState::Dead
        );
        // changed descriptor: replaced and running again
        let mut changed = job("a");
        changed.resources.cpu_mhz = 2000;
        orchestrator.start(&changed).await.unwrap();
        assert_eq!(
            orchestrator.info("a").await.unwrap().state,
            JobState::Running
        );
    }

    #[test]
    async fn stop_of_missing_job_succeeds() {
        let orchestrator = InMemoryOrchestrator::new("localhost");
        orchestrator.stop("ghost").await.unwrap();
        assert_eq!(
            orchestrator.info("ghost").await.unwrap().state,
            JobState::Unknown
        );
    }

    #[test]
    async fn cpu_usage_sums_live_jobs() {
        let orchestrator = InMemoryOrchestrator::new("localhost");
        orchestrator.start(&job("a")).await.unwrap();
        orchestrator.start(&job("b")).await.unwrap();
        orchestrator.set_state("b", JobState::Dead);
        assert_eq!(orchestrator.total_cpu_usage_mhz().await.unwrap(), 1000);
    }
}
