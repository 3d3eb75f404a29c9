use crate::model::{DeployRequest, JobLogEntry, Model, User};
use crate::repo::model::ModelRepo;
use crate::repo::{RepoError, TransitionOutcome};
use crate::service::job::{
    deploy_job_name, deployment_log_path, model_prefix, DeploySettings, JobLauncher, LaunchError,
};
use crate::service::permission::{PermissionError, PermissionService};
use bazaar_common::model::{
    DefaultPermission, DeployStatus, JobLogLevel, ModelAccess, ModelId, ModelPermission,
    TrainStatus,
};
use bazaar_common::SafeDisplay;
use bazaar_service_base::storage::{SharedStorage, StorageError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DeployServiceError {
    #[error("model not found: {0}")]
    NotFound(ModelId),
    #[error("model is not trained")]
    NotTrained,
    #[error("dependency {0} is not trained")]
    DependencyNotTrained(ModelId),
    #[error("deployment name already in use")]
    DeploymentNameTaken,
    #[error("model with this name already exists")]
    NameTaken,
    #[error("cannot move deployment from {current} to {requested}")]
    InvalidTransition {
        current: DeployStatus,
        requested: DeployStatus,
    },
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for DeployServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            DeployServiceError::Permission(inner) => inner.to_safe_string(),
            DeployServiceError::Launch(inner) => inner.to_safe_string(),
            DeployServiceError::Storage(inner) => inner.to_safe_string(),
            DeployServiceError::InternalRepoError(inner) => inner.to_safe_string(),
            _ => self.to_string(),
        }
    }
}

pub struct DeployService {
    model_repo: Arc<dyn ModelRepo>,
    permissions: Arc<PermissionService>,
    launcher: Arc<JobLauncher>,
    storage: Arc<dyn SharedStorage>,
}

impl DeployService {
    pub fn new(
        model_repo: Arc<dyn ModelRepo>,
        permissions: Arc<PermissionService>,
        launcher: Arc<JobLauncher>,
        storage: Arc<dyn SharedStorage>,
    ) -> Self {
        Self {
            model_repo,
            permissions,
            launcher,
            storage,
        }
    }

    /// Deploys a model; workflow models first launch their component models
    /// transitively (dependencies before dependents).
    pub async fn deploy(
        &self,
        user: &User,
        id: &ModelId,
        request: &DeployRequest,
    ) -> Result<String, DeployServiceError> {
        let model = self
            .permissions
            .require(user, id, ModelPermission::Owner)
            .await?;

        if model.train_status != TrainStatus::Complete {
            return Err(DeployServiceError::NotTrained);
        }

        // dependencies first; the graph is acyclic by construction
        let order = self.deploy_order(&model).await?;
        for dependency in &order {
            if dependency.train_status != TrainStatus::Complete {
                return Err(DeployServiceError::DependencyNotTrained(dependency.id));
            }
        }
        for dependency in order {
            if dependency.deploy_status.is_settled() {
                self.deploy_one(&dependency, &DeployRequest::default(), false)
                    .await?;
            }
        }

        self.deploy_one(&model, request, true).await?;

        let ingress_path = ingress_path_of(&model, request);
        Ok(self.launcher.ingress_url(&ingress_path))
    }

    /// Transitive dependencies, deepest first, excluding the root.
    async fn deploy_order(&self, root: &Model) -> Result<Vec<Model>, DeployServiceError> {
        let mut order: Vec<Model> = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(model) = stack.pop() {
            for dependency in self.model_repo.dependencies_of(&model.id).await? {
                if !order.iter().any(|m| m.id == dependency.id) {
                    stack.push(dependency.clone());
                    order.push(dependency);
                }
            }
        }
        order.reverse();
        Ok(order)
    }

    async fn deploy_one(
        &self,
        model: &Model,
        request: &DeployRequest,
        is_root: bool,
    ) -> Result<(), DeployServiceError> {
        if let Some(deployment_name) = &request.deployment_name {
            match self
                .model_repo
                .set_deployment_name(&model.id, deployment_name)
                .await
            {
                Ok(_) => {}
                Err(RepoError::UniqueViolation(_)) => {
                    return Err(DeployServiceError::DeploymentNameTaken)
                }
                Err(other) => return Err(other.into()),
            }
        }

        match self
            .model_repo
            .transition_deploy(&model.id, DeployStatus::Starting)
            .await?
        {
            TransitionOutcome::Applied { .. } | TransitionOutcome::Unchanged => {}
            TransitionOutcome::Refused { current } => {
                if is_root {
                    return Err(DeployServiceError::InvalidTransition {
                        current,
                        requested: DeployStatus::Starting,
                    });
                }
                // a component already rolling out or serving is fine
                return Ok(());
            }
            TransitionOutcome::NotFound => return Err(DeployServiceError::NotFound(model.id)),
        }

        let settings = DeploySettings {
            ingress_path: ingress_path_of(model, request),
            autoscaling_enabled: request.autoscaling_enabled,
            min_replicas: request.autoscaling_min.unwrap_or(1).max(1),
            max_replicas: request
                .autoscaling_max
                .unwrap_or(if request.autoscaling_enabled { 4 } else { 1 }),
            memory_mb: request.memory,
        };

        if let Err(launch_error) = self.launcher.launch_deploy_job(model, &settings).await {
            warn!(model_id = %model.id, "deployment launch failed: {launch_error}");
            let _ = self
                .model_repo
                .transition_deploy(&model.id, DeployStatus::Failed)
                .await;
            // tear down whatever subset the orchestrator managed to create
            let _ = self.launcher.stop_job(&deploy_job_name(&model.id)).await;
            return Err(launch_error.into());
        }

        info!(model_id = %model.id, "deployment started");
        Ok(())
    }

    pub async fn undeploy(&self, user: &User, id: &ModelId) -> Result<(), DeployServiceError> {
        self.permissions
            .require(user, id, ModelPermission::Owner)
            .await?;
        self.launcher.stop_job(&deploy_job_name(id)).await?;
        match self
            .model_repo
            .transition_deploy(id, DeployStatus::Stopped)
            .await?
        {
            TransitionOutcome::Applied { .. } | TransitionOutcome::Unchanged => Ok(()),
            TransitionOutcome::Refused { current } => Err(DeployServiceError::InvalidTransition {
                current,
                requested: DeployStatus::Stopped,
            }),
            TransitionOutcome::NotFound => Err(DeployServiceError::NotFound(*id)),
        }
    }

    pub async fn status(
        &self,
        user: &User,
        id: &ModelId,
    ) -> Result<DeployStatus, DeployServiceError> {
        let model = self
            .permissions
            .require(user, id, ModelPermission::Read)
            .await?;
        Ok(model.deploy_status)
    }

    pub async fn logs(
        &self,
        user: &User,
        id: &ModelId,
    ) -> Result<Vec<JobLogEntry>, DeployServiceError> {
        self.permissions
            .require(user, id, ModelPermission::Read)
            .await?;
        Ok(self.model_repo.job_logs(id).await?)
    }

    /// Persists the live state of a deployed model as a new model owned by
    /// the caller; the deploy job has written its current artifacts back to
    /// the model prefix beforehand.
    pub async fn save(
        &self,
        user: &User,
        id: &ModelId,
        model_name: &str,
    ) -> Result<Model, DeployServiceError> {
        let source = self
            .permissions
            .require(user, id, ModelPermission::Read)
            .await?;

        let new_model = Model {
            id: ModelId::new_v4(),
            name: model_name.to_string(),
            model_type: source.model_type,
            published_date: Utc::now(),
            train_status: TrainStatus::Complete,
            deploy_status: DeployStatus::NotStarted,
            access: ModelAccess::Private,
            default_permission: DefaultPermission::Read,
            deployment_name: None,
            base_model_id: Some(source.id),
            user_id: user.id,
            team_id: None,
        };
        match self.model_repo.create(&new_model).await {
            Ok(()) => {}
            Err(RepoError::UniqueViolation(_)) => return Err(DeployServiceError::NameTaken),
            Err(other) => return Err(other.into()),
        }

        // copy the artifact subtree through the storage contract
        let archive = self.storage.zip(&model_prefix(&source.id)).await?;
        let bytes = self.storage.read(&archive).await?;
        self.storage.delete(&archive).await?;
        let new_archive = format!("{}.zip", model_prefix(&new_model.id));
        self.storage.write(&new_archive, &bytes).await?;
        self.storage.unzip(&new_archive).await?;
        self.storage.delete(&new_archive).await?;

        info!(source = %id, saved = %new_model.id, "saved deployed model");
        Ok(new_model)
    }

    /// Job-token callback mirroring the train one.
    pub async fn update_status(
        &self,
        model_id: &ModelId,
        status: DeployStatus,
        attributes: Option<&BTreeMap<String, String>>,
    ) -> Result<(), DeployServiceError> {
        match self.model_repo.transition_deploy(model_id, status).await? {
            TransitionOutcome::Applied { from } => {
                info!(model_id = %model_id, %from, to = %status, "deploy status updated");
            }
            TransitionOutcome::Unchanged => {}
            TransitionOutcome::Refused { current } => {
                return Err(DeployServiceError::InvalidTransition {
                    current,
                    requested: status,
                });
            }
            TransitionOutcome::NotFound => return Err(DeployServiceError::NotFound(*model_id)),
        }
        if let Some(attributes) = attributes {
            for (key, value) in attributes {
                self.model_repo
                    .upsert_attribute(model_id, key, value)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn record_log(
        &self,
        model_id: &ModelId,
        level: JobLogLevel,
        message: &str,
    ) -> Result<(), DeployServiceError> {
        if self.model_repo.get(model_id).await?.is_none() {
            return Err(DeployServiceError::NotFound(*model_id));
        }
        self.model_repo
            .append_job_log(model_id, level, message)
            .await?;
        let line = format!("{} [{level}] {message}\n", Utc::now().to_rfc3339());
        self.storage
            .append(&deployment_log_path(model_id), line.as_bytes())
            .await?;
        Ok(())
    }
}

fn ingress_path_of(model: &Model, request: &DeployRequest) -> String {
    let name = request
        .deployment_name
        .clone()
        .or_else(|| model.deployment_name.clone())
        .unwrap_or_else(|| model.id.to_string());
    format!("/{name}")
}
