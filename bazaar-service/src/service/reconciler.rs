use crate::config::ReconcilerConfig;
use crate::repo::model::ModelRepo;
use crate::repo::TransitionOutcome;
use crate::service::job::{deploy_job_name, train_job_name};
use bazaar_common::model::{DeployStatus, JobLogLevel, TrainStatus};
use bazaar_service_base::orchestrator::{JobState, Orchestrator};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Maps an observed training job state onto the next model status, if any.
/// Heartbeat-driven transitions stay with the job callbacks; the reconciler
/// only converges on death and disappearance.
pub fn next_train_status(
    current: TrainStatus,
    observed: JobState,
    unknown_ticks: u32,
    unknown_ticks_to_failure: u32,
) -> Option<TrainStatus> {
    if current.is_terminal() || current == TrainStatus::NotStarted {
        return None;
    }
    match observed {
        // the job ended without calling back complete
        JobState::Dead | JobState::Failed => Some(TrainStatus::Failed),
        JobState::Unknown if unknown_ticks >= unknown_ticks_to_failure => {
            Some(TrainStatus::Failed)
        }
        _ => None,
    }
}

/// Deploy counterpart; additionally heals `starting` to `in_progress` once
/// the service is observably running.
pub fn next_deploy_status(
    current: DeployStatus,
    observed: JobState,
    unknown_ticks: u32,
    unknown_ticks_to_failure: u32,
) -> Option<DeployStatus> {
    if current.is_settled() {
        return None;
    }
    match observed {
        JobState::Dead | JobState::Failed => Some(DeployStatus::Failed),
        JobState::Unknown if unknown_ticks >= unknown_ticks_to_failure => {
            Some(DeployStatus::Failed)
        }
        JobState::Running if current == DeployStatus::Starting => Some(DeployStatus::InProgress),
        _ => None,
    }
}

/// Background task converging DB-stored statuses toward orchestrator truth.
/// One instance runs per process; each tick holds row locks only for the
/// individual status writes.
pub struct Reconciler {
    model_repo: Arc<dyn ModelRepo>,
    orchestrator: Arc<dyn Orchestrator>,
    config: ReconcilerConfig,
    unknown_ticks: Mutex<HashMap<(Uuid, &'static str), u32>>,
}

impl Reconciler {
    pub fn new(
        model_repo: Arc<dyn ModelRepo>,
        orchestrator: Arc<dyn Orchestrator>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            model_repo,
            orchestrator,
            config,
            unknown_ticks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the reconcile loop. Errors (and panics inside a tick) back off
    /// exponentially; the loop exits cooperatively on cancellation.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.config.interval, "status reconciler started");
            let mut backoff = self.config.interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("status reconciler stopping");
                        break;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }

                let this = self.clone();
                // a panicking tick must not take the loop down
                let outcome = tokio::spawn(async move { this.tick().await }).await;
                backoff = match outcome {
                    Ok(Ok(())) => self.config.interval,
                    Ok(Err(error)) => {
                        warn!("reconciler tick failed: {error}");
                        (backoff * 2).min(MAX_BACKOFF)
                    }
                    Err(join_error) => {
                        warn!("reconciler tick panicked: {join_error}");
                        (backoff * 2).min(MAX_BACKOFF)
                    }
                };
            }
        })
    }

    pub async fn tick(&self) -> anyhow::Result<()> {
        let models = self.model_repo.non_terminal().await?;
        debug!(count = models.len(), "reconciling non-terminal models");

        for model in models {
            if matches!(
                model.train_status,
                TrainStatus::Starting | TrainStatus::InProgress
            ) {
                let info = self.orchestrator.info(&train_job_name(&model.id)).await?;
                let ticks = self.bump_unknown(model.id.0, "train", info.state);
                if let Some(next) = next_train_status(
                    model.train_status,
                    info.state,
                    ticks,
                    self.config.unknown_ticks_to_failure,
                ) {
                    let outcome = self.model_repo.transition_train(&model.id, next).await?;
                    if matches!(outcome, TransitionOutcome::Applied { .. })
                        && next == TrainStatus::Failed
                    {
                        self.model_repo
                            .append_job_log(
                                &model.id,
                                JobLogLevel::Warning,
                                "training job is no longer running; marking training failed",
                            )
                            .await?;
                    }
                }
            }

            if !model.deploy_status.is_settled() {
                let info = self.orchestrator.info(&deploy_job_name(&model.id)).await?;
                let ticks = self.bump_unknown(model.id.0, "deploy", info.state);
                if let Some(next) = next_deploy_status(
                    model.deploy_status,
                    info.state,
                    ticks,
                    self.config.unknown_ticks_to_failure,
                ) {
                    let outcome = self.model_repo.transition_deploy(&model.id, next).await?;
                    if matches!(outcome, TransitionOutcome::Applied { .. })
                        && next == DeployStatus::Failed
                    {
                        self.model_repo
                            .append_job_log(
                                &model.id,
                                JobLogLevel::Warning,
                                "deployment is no longer running; marking deployment failed",
                            )
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Counts consecutive `unknown` observations per job; any other state
    /// resets the counter.
    fn bump_unknown(&self, model_id: Uuid, kind: &'static str, state: JobState) -> u32 {
        let mut counters = self.unknown_ticks.lock();
        if state == JobState::Unknown {
            let counter = counters.entry((model_id, kind)).or_insert(0);
            *counter += 1;
            *counter
        } else {
            counters.remove(&(model_id, kind));
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn dead_training_job_fails_the_model() {
        assert_eq!(
            next_train_status(TrainStatus::InProgress, JobState::Dead, 0, 3),
            Some(TrainStatus::Failed)
        );
        assert_eq!(
            next_train_status(TrainStatus::Starting, JobState::Failed, 0, 3),
            Some(TrainStatus::Failed)
        );
    }

    #[test]
    fn running_training_job_is_left_to_callbacks() {
        assert_eq!(
            next_train_status(TrainStatus::Starting, JobState::Running, 0, 3),
            None
        );
        assert_eq!(
            next_train_status(TrainStatus::InProgress, JobState::Pending, 0, 3),
            None
        );
    }

    #[test]
    fn terminal_training_states_are_never_touched() {
        for current in [
            TrainStatus::Complete,
            TrainStatus::Failed,
            TrainStatus::Stopped,
            TrainStatus::NotStarted,
        ] {
            assert_eq!(next_train_status(current, JobState::Dead, 99, 3), None);
        }
    }

    #[test]
    fn unknown_is_tolerated_until_the_threshold() {
        assert_eq!(
            next_train_status(TrainStatus::InProgress, JobState::Unknown, 1, 3),
            None
        );
        assert_eq!(
            next_train_status(TrainStatus::InProgress, JobState::Unknown, 2, 3),
            None
        );
        assert_eq!(
            next_train_status(TrainStatus::InProgress, JobState::Unknown, 3, 3),
            Some(TrainStatus::Failed)
        );
    }

    #[test]
    fn deploy_heals_starting_to_in_progress() {
        assert_eq!(
            next_deploy_status(DeployStatus::Starting, JobState::Running, 0, 3),
            Some(DeployStatus::InProgress)
        );
        assert_eq!(
            next_deploy_status(DeployStatus::Complete, JobState::Running, 0, 3),
            None
        );
    }

    #[test]
    fn dead_deployment_fails_from_any_live_state() {
        for current in [
            DeployStatus::Starting,
            DeployStatus::InProgress,
            DeployStatus::Complete,
        ] {
            assert_eq!(
                next_deploy_status(current, JobState::Dead, 0, 3),
                Some(DeployStatus::Failed)
            );
        }
    }

    #[test]
    fn settled_deployments_are_ignored() {
        for current in [
            DeployStatus::NotStarted,
            DeployStatus::Stopped,
            DeployStatus::Failed,
        ] {
            assert_eq!(next_deploy_status(current, JobState::Dead, 9, 3), None);
        }
    }
}
