use crate::model::{Model, User};
use crate::repo::model::{AddDependencyOutcome, ModelRepo};
use crate::repo::RepoError;
use crate::service::permission::{PermissionError, PermissionService};
use bazaar_common::model::{
    DefaultPermission, DeployStatus, ModelAccess, ModelId, ModelPermission, ModelType, TrainStatus,
};
use bazaar_common::SafeDisplay;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowServiceError {
    #[error("component {component} must be of type {expected}")]
    ComponentTypeMismatch {
        component: ModelId,
        expected: ModelType,
    },
    #[error("component {0} is not trained")]
    ComponentNotTrained(ModelId),
    #[error("model with this name already exists")]
    NameTaken,
    #[error("dependency edge refused for {0}")]
    DependencyRefused(ModelId),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for WorkflowServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            WorkflowServiceError::Permission(inner) => inner.to_safe_string(),
            WorkflowServiceError::InternalRepoError(inner) => inner.to_safe_string(),
            _ => self.to_string(),
        }
    }
}

/// Composes primitive models into workflow models. A workflow carries no
/// trained weights, so it is born with `train_status = complete`.
pub struct WorkflowService {
    model_repo: Arc<dyn ModelRepo>,
    permissions: Arc<PermissionService>,
}

impl WorkflowService {
    pub fn new(model_repo: Arc<dyn ModelRepo>, permissions: Arc<PermissionService>) -> Self {
        Self {
            model_repo,
            permissions,
        }
    }

    pub async fn create_enterprise_search(
        &self,
        user: &User,
        model_name: &str,
        retrieval_id: &ModelId,
        guardrail_id: Option<&ModelId>,
    ) -> Result<Model, WorkflowServiceError> {
        self.create_workflow(
            user,
            ModelType::EnterpriseSearch,
            model_name,
            retrieval_id,
            guardrail_id,
        )
        .await
    }

    pub async fn create_knowledge_extraction(
        &self,
        user: &User,
        model_name: &str,
        retrieval_id: &ModelId,
        guardrail_id: Option<&ModelId>,
    ) -> Result<Model, WorkflowServiceError> {
        self.create_workflow(
            user,
            ModelType::Ke,
            model_name,
            retrieval_id,
            guardrail_id,
        )
        .await
    }

    async fn create_workflow(
        &self,
        user: &User,
        workflow_type: ModelType,
        model_name: &str,
        retrieval_id: &ModelId,
        guardrail_id: Option<&ModelId>,
    ) -> Result<Model, WorkflowServiceError> {
        let retrieval = self
            .permissions
            .require(user, retrieval_id, ModelPermission::Read)
            .await?;
        self.check_component(&retrieval, ModelType::Ndb)?;

        let mut components = vec![retrieval];
        if let Some(guardrail_id) = guardrail_id {
            let guardrail = self
                .permissions
                .require(user, guardrail_id, ModelPermission::Read)
                .await?;
            self.check_component(&guardrail, ModelType::NlpToken)?;
            components.push(guardrail);
        }

        let workflow = Model {
            id: ModelId::new_v4(),
            name: model_name.to_string(),
            model_type: workflow_type,
            published_date: Utc::now(),
            train_status: TrainStatus::Complete,
            deploy_status: DeployStatus::NotStarted,
            access: ModelAccess::Private,
            default_permission: DefaultPermission::Read,
            deployment_name: None,
            base_model_id: None,
            user_id: user.id,
            team_id: None,
        };
        match self.model_repo.create(&workflow).await {
            Ok(()) => {}
            Err(RepoError::UniqueViolation(_)) => return Err(WorkflowServiceError::NameTaken),
            Err(other) => return Err(other.into()),
        }

        for component in &components {
            match self
                .model_repo
                .add_dependency(&workflow.id, &component.id)
                .await?
            {
                AddDependencyOutcome::Added => {}
                AddDependencyOutcome::WouldCycle | AddDependencyOutcome::NotFound => {
                    // roll the half-created workflow back before surfacing
                    let _ = self.model_repo.delete(&workflow.id).await;
                    return Err(WorkflowServiceError::DependencyRefused(component.id));
                }
            }
        }

        info!(
            workflow_id = %workflow.id,
            workflow_type = %workflow_type,
            components = components.len(),
            "created workflow"
        );
        Ok(workflow)
    }

    fn check_component(
        &self,
        component: &Model,
        expected: ModelType,
    ) -> Result<(), WorkflowServiceError> {
        if component.model_type != expected {
            return Err(WorkflowServiceError::ComponentTypeMismatch {
                component: component.id,
                expected,
            });
        }
        if component.train_status != TrainStatus::Complete {
            return Err(WorkflowServiceError::ComponentNotTrained(component.id));
        }
        Ok(())
    }
}
