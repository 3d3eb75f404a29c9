use crate::model::{DataSource, JobLogEntry, Model, TrainRequest, User};
use crate::repo::model::ModelRepo;
use crate::repo::upload::UploadRepo;
use crate::repo::{RepoError, TransitionOutcome};
use crate::service::job::{
    data_prefix, train_job_name, train_log_path, train_report_path, JobLauncher, LaunchError,
};
use crate::service::permission::{PermissionError, PermissionService};
use bazaar_common::model::{
    DefaultPermission, DeployStatus, JobLogLevel, ModelAccess, ModelId, ModelPermission, ModelType,
    TrainStatus, UploadId,
};
use bazaar_common::SafeDisplay;
use bazaar_service_base::storage::{SharedStorage, StorageError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TrainServiceError {
    #[error("model not found: {0}")]
    NotFound(ModelId),
    #[error("model with this name already exists")]
    NameTaken,
    #[error("invalid training data: {0}")]
    InvalidData(String),
    #[error("base model must be of type {expected}")]
    BaseModelMismatch { expected: ModelType },
    #[error("cannot move training from {current} to {requested}")]
    InvalidTransition {
        current: TrainStatus,
        requested: TrainStatus,
    },
    #[error("training report not found (status 404)")]
    ReportMissing,
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for TrainServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            TrainServiceError::Permission(inner) => inner.to_safe_string(),
            TrainServiceError::Launch(inner) => inner.to_safe_string(),
            TrainServiceError::Storage(inner) => inner.to_safe_string(),
            TrainServiceError::InternalRepoError(inner) => inner.to_safe_string(),
            _ => self.to_string(),
        }
    }
}

pub struct TrainService {
    model_repo: Arc<dyn ModelRepo>,
    upload_repo: Arc<dyn UploadRepo>,
    permissions: Arc<PermissionService>,
    launcher: Arc<JobLauncher>,
    storage: Arc<dyn SharedStorage>,
}

impl TrainService {
    pub fn new(
        model_repo: Arc<dyn ModelRepo>,
        upload_repo: Arc<dyn UploadRepo>,
        permissions: Arc<PermissionService>,
        launcher: Arc<JobLauncher>,
        storage: Arc<dyn SharedStorage>,
    ) -> Self {
        Self {
            model_repo,
            upload_repo,
            permissions,
            launcher,
            storage,
        }
    }

    /// Creates a model row and launches the training job. The row is
    /// committed (status `starting`) before the orchestrator is called; a
    /// failed launch compensates by marking the model failed.
    pub async fn start(
        &self,
        user: &User,
        model_type: ModelType,
        task: &str,
        request: &TrainRequest,
        base_model_required: bool,
    ) -> Result<Model, TrainServiceError> {
        if base_model_required && request.base_model_id.is_none() {
            return Err(TrainServiceError::InvalidData(
                "base_model_id is required for retraining".to_string(),
            ));
        }

        if let Some(base_model_id) = &request.base_model_id {
            let base = self
                .permissions
                .require(user, base_model_id, ModelPermission::Read)
                .await?;
            if base.model_type != model_type {
                return Err(TrainServiceError::BaseModelMismatch {
                    expected: model_type,
                });
            }
        }

        let data_path = self.resolve_data(user, request.data.as_ref(), task).await?;

        let model = Model {
            id: ModelId::new_v4(),
            name: request.model_name.clone(),
            model_type,
            published_date: Utc::now(),
            train_status: TrainStatus::NotStarted,
            deploy_status: DeployStatus::NotStarted,
            access: ModelAccess::Private,
            default_permission: DefaultPermission::Read,
            deployment_name: None,
            base_model_id: request.base_model_id,
            user_id: user.id,
            team_id: None,
        };
        match self.model_repo.create(&model).await {
            Ok(()) => {}
            Err(RepoError::UniqueViolation(_)) => return Err(TrainServiceError::NameTaken),
            Err(other) => return Err(other.into()),
        }

        let config = serde_json::json!({
            "model_id": model.id,
            "model_type": model_type,
            "task": task,
            "data_path": data_path,
            "base_model_id": request.base_model_id,
            "model_options": request.model_options,
        });

        self.model_repo
            .transition_train(&model.id, TrainStatus::Starting)
            .await?;

        if let Err(launch_error) = self
            .launcher
            .launch_train_job(&model, &config, &request.job_options)
            .await
        {
            warn!(model_id = %model.id, "training launch failed: {launch_error}");
            let _ = self
                .model_repo
                .transition_train(&model.id, TrainStatus::Failed)
                .await;
            let _ = self
                .model_repo
                .append_job_log(
                    &model.id,
                    JobLogLevel::Error,
                    &format!("training job failed to start: {}", launch_error.to_safe_string()),
                )
                .await;
            return Err(launch_error.into());
        }

        info!(model_id = %model.id, task, "training started");
        self.model_repo
            .get(&model.id)
            .await?
            .ok_or(TrainServiceError::NotFound(model.id))
    }

    async fn resolve_data(
        &self,
        user: &User,
        data: Option<&DataSource>,
        task: &str,
    ) -> Result<Option<String>, TrainServiceError> {
        let Some(data) = data else {
            // data generation produces its own training set
            if task == "datagen" {
                return Ok(None);
            }
            return Err(TrainServiceError::InvalidData(
                "a data source is required".to_string(),
            ));
        };
        match data.location.as_str() {
            "upload" => {
                let upload_id = uuid::Uuid::parse_str(&data.path).map(UploadId).map_err(|_| {
                    TrainServiceError::InvalidData(format!("invalid upload id: {}", data.path))
                })?;
                let session = self
                    .upload_repo
                    .get(&upload_id)
                    .await?
                    .filter(|session| session.user_id == user.id)
                    .ok_or_else(|| {
                        TrainServiceError::InvalidData(format!("unknown upload: {upload_id}"))
                    })?;
                Ok(Some(data_prefix(&session.id)))
            }
            "share" => {
                if !self.storage.exists(&data.path).await? {
                    return Err(TrainServiceError::InvalidData(format!(
                        "no such path on shared storage: {}",
                        data.path
                    )));
                }
                Ok(Some(data.path.clone()))
            }
            other => Err(TrainServiceError::InvalidData(format!(
                "unknown data location: {other}"
            ))),
        }
    }

    pub async fn stop(&self, user: &User, id: &ModelId) -> Result<(), TrainServiceError> {
        let model = self
            .permissions
            .require(user, id, ModelPermission::Write)
            .await?;
        self.launcher.stop_job(&train_job_name(id)).await?;
        match self
            .model_repo
            .transition_train(id, TrainStatus::Stopped)
            .await?
        {
            TransitionOutcome::Applied { .. } | TransitionOutcome::Unchanged => Ok(()),
            TransitionOutcome::Refused { current } => Err(TrainServiceError::InvalidTransition {
                current,
                requested: TrainStatus::Stopped,
            }),
            TransitionOutcome::NotFound => Err(TrainServiceError::NotFound(model.id)),
        }
    }

    pub async fn status(&self, user: &User, id: &ModelId) -> Result<TrainStatus, TrainServiceError> {
        let model = self
            .permissions
            .require(user, id, ModelPermission::Read)
            .await?;
        Ok(model.train_status)
    }

    pub async fn logs(&self, user: &User, id: &ModelId) -> Result<Vec<JobLogEntry>, TrainServiceError> {
        self.permissions
            .require(user, id, ModelPermission::Read)
            .await?;
        Ok(self.model_repo.job_logs(id).await?)
    }

    pub async fn report(&self, user: &User, id: &ModelId) -> Result<Vec<u8>, TrainServiceError> {
        self.permissions
            .require(user, id, ModelPermission::Read)
            .await?;
        match self.storage.read(&train_report_path(id)).await {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(StorageError::NotFound(_)) => Err(TrainServiceError::ReportMissing),
            Err(other) => Err(other.into()),
        }
    }

    /// Job-token callback: move the training state machine and record any
    /// attributes the job reports.
    pub async fn update_status(
        &self,
        model_id: &ModelId,
        status: TrainStatus,
        attributes: Option<&BTreeMap<String, String>>,
    ) -> Result<(), TrainServiceError> {
        match self.model_repo.transition_train(model_id, status).await? {
            TransitionOutcome::Applied { from } => {
                info!(model_id = %model_id, %from, to = %status, "train status updated");
            }
            TransitionOutcome::Unchanged => {}
            TransitionOutcome::Refused { current } => {
                return Err(TrainServiceError::InvalidTransition {
                    current,
                    requested: status,
                });
            }
            TransitionOutcome::NotFound => return Err(TrainServiceError::NotFound(*model_id)),
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

    /// Job-token callback: persist a warning/error line and mirror it into
    /// the train log on shared storage.
    pub async fn record_log(
        &self,
        model_id: &ModelId,
        level: JobLogLevel,
        message: &str,
    ) -> Result<(), TrainServiceError> {
        if self.model_repo.get(model_id).await?.is_none() {
            return Err(TrainServiceError::NotFound(*model_id));
        }
        self.model_repo
            .append_job_log(model_id, level, message)
            .await?;
        let line = format!("{} [{level}] {message}\n", Utc::now().to_rfc3339());
        self.storage
            .append(&train_log_path(model_id), line.as_bytes())
            .await?;
        Ok(())
    }
}
