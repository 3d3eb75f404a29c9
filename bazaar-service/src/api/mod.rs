use crate::bootstrap::Services;
use crate::service::api_key::ApiKeyError;
use crate::service::audit::AuditLog;
use crate::service::auth::AuthServiceError;
use crate::service::deploy::DeployServiceError;
use crate::service::identity::IdentityError;
use crate::service::job::LaunchError;
use crate::service::model::ModelServiceError;
use crate::service::permission::PermissionError;
use crate::service::recovery::RecoveryError;
use crate::service::team::TeamServiceError;
use crate::service::train::TrainServiceError;
use crate::service::upload::UploadServiceError;
use crate::service::user::UserServiceError;
use crate::service::workflow::WorkflowServiceError;
use bazaar_common::auth::PrincipalSlot;
use bazaar_common::metrics::TraceErrorKind;
use bazaar_common::SafeDisplay;
use bazaar_service_base::orchestrator::OrchestratorError;
use bazaar_service_base::repo::RepoError;
use bazaar_service_base::storage::StorageError;
use poem::{Endpoint, IntoResponse, Middleware, Request, Response};
use poem_openapi::payload::PlainText;
use poem_openapi::{ApiResponse, OpenApiService, Tags};
use std::sync::Arc;

mod deploy;
mod healthcheck;
mod model;
mod recovery;
mod team;
mod telemetry;
mod train;
mod user;
mod workflow;

#[derive(Tags)]
pub enum ApiTags {
    User,
    Team,
    Model,
    Train,
    Deploy,
    Workflow,
    Recovery,
    Telemetry,
    Health,
}

/// Error bodies are plain text on purpose: clients match on status code and
/// substring, so the wording stays short and stable.
#[derive(ApiResponse, Debug)]
pub enum ApiError {
    #[oai(status = 400)]
    BadRequest(PlainText<String>),
    #[oai(status = 401)]
    Unauthorized(PlainText<String>),
    #[oai(status = 403)]
    Forbidden(PlainText<String>),
    #[oai(status = 404)]
    NotFound(PlainText<String>),
    #[oai(status = 409)]
    Conflict(PlainText<String>),
    #[oai(status = 500)]
    InternalError(PlainText<String>),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(PlainText(message.into()))
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized(PlainText(message.into()))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(PlainText(message.into()))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict(PlainText(message.into()))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::InternalError(PlainText(message.into()))
    }
}

impl TraceErrorKind for ApiError {
    fn trace_error_kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Unauthorized(_) => "Unauthorized",
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict(_) => "Conflict",
            ApiError::InternalError(_) => "InternalError",
        }
    }

    fn is_expected(&self) -> bool {
        !matches!(self, ApiError::InternalError(_))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<AuthServiceError> for ApiError {
    fn from(value: AuthServiceError) -> Self {
        match value {
            AuthServiceError::InvalidToken(_) | AuthServiceError::UnknownAccount => {
                ApiError::unauthorized(value.to_safe_string())
            }
            AuthServiceError::AdminRequired => {
                ApiError::Forbidden(PlainText(value.to_safe_string()))
            }
            AuthServiceError::InternalRepoError(_) => {
                ApiError::internal(value.to_safe_string())
            }
        }
    }
}

impl From<PermissionError> for ApiError {
    fn from(value: PermissionError) -> Self {
        match value {
            PermissionError::ModelNotFound(_) => ApiError::not_found(value.to_safe_string()),
            PermissionError::Denied { .. } => ApiError::unauthorized(value.to_safe_string()),
            PermissionError::InternalRepoError(_) => ApiError::internal(value.to_safe_string()),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(value: IdentityError) -> Self {
        match value {
            IdentityError::InvalidCredentials => ApiError::unauthorized(value.to_safe_string()),
            IdentityError::SignupDisabled | IdentityError::PasswordRequired => {
                ApiError::bad_request(value.to_safe_string())
            }
            IdentityError::UserExists(_) => ApiError::conflict(value.to_safe_string()),
            IdentityError::Provider(_)
            | IdentityError::Hashing(_)
            | IdentityError::InternalRepoError(_) => ApiError::internal(value.to_safe_string()),
        }
    }
}

impl From<UserServiceError> for ApiError {
    fn from(value: UserServiceError) -> Self {
        match value {
            UserServiceError::UserNotFound(_) => ApiError::not_found(value.to_safe_string()),
            UserServiceError::LastAdmin => ApiError::bad_request(value.to_safe_string()),
            UserServiceError::OwnsDependedModels => ApiError::conflict(value.to_safe_string()),
            UserServiceError::Identity(inner) => inner.into(),
            UserServiceError::Model(inner) => inner.into(),
            UserServiceError::Token(_) | UserServiceError::InternalRepoError(_) => {
                ApiError::internal(value.to_safe_string())
            }
        }
    }
}

impl From<TeamServiceError> for ApiError {
    fn from(value: TeamServiceError) -> Self {
        match value {
            TeamServiceError::TeamNotFound(_) | TeamServiceError::ModelNotFound(_) => {
                ApiError::not_found(value.to_safe_string())
            }
            TeamServiceError::NotAMember => ApiError::bad_request(value.to_safe_string()),
            TeamServiceError::TeamAdminRequired | TeamServiceError::ModelOwnerRequired => {
                ApiError::unauthorized(value.to_safe_string())
            }
            TeamServiceError::NameTaken => ApiError::conflict(value.to_safe_string()),
            TeamServiceError::InternalRepoError(_) => ApiError::internal(value.to_safe_string()),
        }
    }
}

impl From<ModelServiceError> for ApiError {
    fn from(value: ModelServiceError) -> Self {
        match value {
            ModelServiceError::NotFound(_) => ApiError::not_found(value.to_safe_string()),
            ModelServiceError::HasDependents => ApiError::conflict(value.to_safe_string()),
            ModelServiceError::ProtectedWithoutTeam => {
                ApiError::bad_request(value.to_safe_string())
            }
            ModelServiceError::Permission(inner) => inner.into(),
            ModelServiceError::Launch(inner) => inner.into(),
            ModelServiceError::Storage(inner) => inner.into(),
            ModelServiceError::InternalRepoError(inner) => inner.into(),
        }
    }
}

impl From<TrainServiceError> for ApiError {
    fn from(value: TrainServiceError) -> Self {
        match value {
            TrainServiceError::NotFound(_) | TrainServiceError::ReportMissing => {
                ApiError::not_found(value.to_safe_string())
            }
            TrainServiceError::NameTaken | TrainServiceError::InvalidTransition { .. } => {
                ApiError::conflict(value.to_safe_string())
            }
            TrainServiceError::InvalidData(_) | TrainServiceError::BaseModelMismatch { .. } => {
                ApiError::bad_request(value.to_safe_string())
            }
            TrainServiceError::Permission(inner) => inner.into(),
            TrainServiceError::Launch(inner) => inner.into(),
            TrainServiceError::Storage(inner) => inner.into(),
            TrainServiceError::InternalRepoError(inner) => inner.into(),
        }
    }
}

impl From<DeployServiceError> for ApiError {
    fn from(value: DeployServiceError) -> Self {
        match value {
            DeployServiceError::NotFound(_) => ApiError::not_found(value.to_safe_string()),
            DeployServiceError::NotTrained | DeployServiceError::DependencyNotTrained(_) => {
                ApiError::bad_request(value.to_safe_string())
            }
            DeployServiceError::DeploymentNameTaken
            | DeployServiceError::NameTaken
            | DeployServiceError::InvalidTransition { .. } => {
                ApiError::conflict(value.to_safe_string())
            }
            DeployServiceError::Permission(inner) => inner.into(),
            DeployServiceError::Launch(inner) => inner.into(),
            DeployServiceError::Storage(inner) => inner.into(),
            DeployServiceError::InternalRepoError(inner) => inner.into(),
        }
    }
}

impl From<WorkflowServiceError> for ApiError {
    fn from(value: WorkflowServiceError) -> Self {
        match value {
            WorkflowServiceError::ComponentTypeMismatch { .. }
            | WorkflowServiceError::ComponentNotTrained(_)
            | WorkflowServiceError::DependencyRefused(_) => {
                ApiError::bad_request(value.to_safe_string())
            }
            WorkflowServiceError::NameTaken => ApiError::conflict(value.to_safe_string()),
            WorkflowServiceError::Permission(inner) => inner.into(),
            WorkflowServiceError::InternalRepoError(inner) => inner.into(),
        }
    }
}

impl From<ApiKeyError> for ApiError {
    fn from(value: ApiKeyError) -> Self {
        match value {
            ApiKeyError::Invalid | ApiKeyError::Expired | ApiKeyError::NotAllowed(_) => {
                ApiError::unauthorized(value.to_safe_string())
            }
            ApiKeyError::Permission(inner) => inner.into(),
            ApiKeyError::Hashing(_) | ApiKeyError::InternalRepoError(_) => {
                ApiError::internal(value.to_safe_string())
            }
        }
    }
}

impl From<UploadServiceError> for ApiError {
    fn from(value: UploadServiceError) -> Self {
        match value {
            UploadServiceError::SessionNotFound => ApiError::not_found(value.to_safe_string()),
            UploadServiceError::NotAModelUpload
            | UploadServiceError::NoChunks
            | UploadServiceError::UnsupportedFiletype => {
                ApiError::bad_request(value.to_safe_string())
            }
            UploadServiceError::NameTaken => ApiError::conflict(value.to_safe_string()),
            UploadServiceError::Storage(inner) => inner.into(),
            UploadServiceError::Token(_) | UploadServiceError::InternalRepoError(_) => {
                ApiError::internal(value.to_safe_string())
            }
        }
    }
}

impl From<RecoveryError> for ApiError {
    fn from(value: RecoveryError) -> Self {
        match value {
            RecoveryError::NothingToBackUp => ApiError::bad_request(value.to_safe_string()),
            RecoveryError::Storage(inner) => inner.into(),
        }
    }
}

impl From<LaunchError> for ApiError {
    fn from(value: LaunchError) -> Self {
        match value {
            // a rejected license check is a client-visible refusal
            LaunchError::License(_) => ApiError::bad_request(value.to_safe_string()),
            LaunchError::Orchestrator(inner) => inner.into(),
            LaunchError::Storage(inner) => inner.into(),
            LaunchError::Token(_) => ApiError::internal(value.to_safe_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(_) => ApiError::not_found(value.to_safe_string()),
            _ => ApiError::internal(value.to_safe_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(value: OrchestratorError) -> Self {
        ApiError::internal(value.to_safe_string())
    }
}

impl From<RepoError> for ApiError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::UniqueViolation(_) => ApiError::conflict(value.to_safe_string()),
            RepoError::Internal(_) => ApiError::internal(value.to_safe_string()),
        }
    }
}

pub type Apis = (
    user::UserApi,
    team::TeamApi,
    model::ModelApi,
    train::TrainApi,
    deploy::DeployApi,
    workflow::WorkflowApi,
    recovery::RecoveryApi,
    telemetry::TelemetryApi,
    healthcheck::HealthcheckApi,
);

pub fn make_open_api_service(services: &Services) -> OpenApiService<Apis, ()> {
    OpenApiService::new(
        (
            user::UserApi {
                auth_service: services.auth_service.clone(),
                user_service: services.user_service.clone(),
            },
            team::TeamApi {
                auth_service: services.auth_service.clone(),
                team_service: services.team_service.clone(),
            },
            model::ModelApi {
                auth_service: services.auth_service.clone(),
                model_service: services.model_service.clone(),
                upload_service: services.upload_service.clone(),
                api_key_service: services.api_key_service.clone(),
            },
            train::TrainApi {
                auth_service: services.auth_service.clone(),
                train_service: services.train_service.clone(),
                upload_service: services.upload_service.clone(),
            },
            deploy::DeployApi {
                auth_service: services.auth_service.clone(),
                deploy_service: services.deploy_service.clone(),
                api_key_service: services.api_key_service.clone(),
            },
            workflow::WorkflowApi {
                auth_service: services.auth_service.clone(),
                workflow_service: services.workflow_service.clone(),
            },
            recovery::RecoveryApi {
                auth_service: services.auth_service.clone(),
                recovery_service: services.recovery_service.clone(),
            },
            telemetry::TelemetryApi {
                orchestrator: services.orchestrator.clone(),
            },
            healthcheck::HealthcheckApi,
        ),
        "Model Bazaar API",
        "2.0",
    )
}

/// Plants the audit principal slot into every request and writes one audit
/// record per completed request.
pub struct AuditMiddleware {
    audit: Arc<AuditLog>,
}

impl AuditMiddleware {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }
}

impl<E: Endpoint> Middleware<E> for AuditMiddleware {
    type Output = AuditMiddlewareImpl<E>;

    fn transform(&self, ep: E) -> Self::Output {
        AuditMiddlewareImpl {
            inner: ep,
            audit: self.audit.clone(),
        }
    }
}

pub struct AuditMiddlewareImpl<E> {
    inner: E,
    audit: Arc<AuditLog>,
}

impl<E: Endpoint> Endpoint for AuditMiddlewareImpl<E> {
    type Output = Response;

    async fn call(&self, mut req: Request) -> poem::Result<Self::Output> {
        let slot = PrincipalSlot::default();
        req.extensions_mut().insert(slot.clone());
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        let response = match self.inner.call(req).await {
            Ok(output) => output.into_response(),
            Err(error) => error.into_response(),
        };

        self.audit
            .record(slot.get(), &method, &path, response.status().as_u16())
            .await;
        Ok(response)
    }
}
