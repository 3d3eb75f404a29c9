use bazaar_common::model::{
    ApiKeyId, DefaultPermission, DeployStatus, JobLogLevel, ModelAccess, ModelId, ModelPermission,
    ModelType, TeamId, TrainStatus, UploadId, UserId,
};
use chrono::{DateTime, Utc};
use poem_openapi::types::multipart::Upload as MultipartUpload;
use poem_openapi::{Multipart, Object};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- domain ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub is_admin: bool,
    pub is_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamMember {
    pub user_id: UserId,
    pub team_id: TeamId,
    pub is_team_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: ModelId,
    pub name: String,
    pub model_type: ModelType,
    pub published_date: DateTime<Utc>,
    pub train_status: TrainStatus,
    pub deploy_status: DeployStatus,
    pub access: ModelAccess,
    pub default_permission: DefaultPermission,
    pub deployment_name: Option<String>,
    pub base_model_id: Option<ModelId>,
    pub user_id: UserId,
    pub team_id: Option<TeamId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDetail {
    pub model: Model,
    pub owner_username: String,
    pub attributes: BTreeMap<String, String>,
    pub dependencies: Vec<Model>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLogEntry {
    pub model_id: ModelId,
    pub level: JobLogLevel,
    pub logged_at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub name: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub all_models: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub id: UploadId,
    pub user_id: UserId,
    pub model_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

// --- user api -------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct SignupResponse {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct LoginResponse {
    pub user_id: UserId,
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct LoginWithTokenRequest {
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: Option<String>,
    #[oai(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct UserResponse {
    pub user_id: UserId,
    pub username: String,
    pub email: String,
    pub is_admin: bool,
    pub is_verified: bool,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            user_id: user.id,
            username: user.username,
            email: user.email,
            is_admin: user.is_admin,
            is_verified: user.is_verified,
        }
    }
}

// --- team api -------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct CreateTeamRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct TeamResponse {
    pub team_id: TeamId,
    pub name: String,
}

impl From<Team> for TeamResponse {
    fn from(team: Team) -> Self {
        Self {
            team_id: team.id,
            name: team.name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct TeamMemberResponse {
    pub user_id: UserId,
    pub team_id: TeamId,
    pub is_team_admin: bool,
}

impl From<TeamMember> for TeamMemberResponse {
    fn from(member: TeamMember) -> Self {
        Self {
            user_id: member.user_id,
            team_id: member.team_id,
            is_team_admin: member.is_team_admin,
        }
    }
}

// --- model api ------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct ModelResponse {
    pub model_id: ModelId,
    pub model_name: String,
    pub model_type: ModelType,
    pub published_date: DateTime<Utc>,
    pub train_status: TrainStatus,
    pub deploy_status: DeployStatus,
    pub access: ModelAccess,
    pub default_permission: DefaultPermission,
    pub deployment_name: Option<String>,
    pub base_model_id: Option<ModelId>,
    pub user_id: UserId,
    pub team_id: Option<TeamId>,
}

impl From<Model> for ModelResponse {
    fn from(model: Model) -> Self {
        Self {
            model_id: model.id,
            model_name: model.name,
            model_type: model.model_type,
            published_date: model.published_date,
            train_status: model.train_status,
            deploy_status: model.deploy_status,
            access: model.access,
            default_permission: model.default_permission,
            deployment_name: model.deployment_name,
            base_model_id: model.base_model_id,
            user_id: model.user_id,
            team_id: model.team_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct ModelDetailResponse {
    #[oai(flatten)]
    pub model: ModelResponse,
    pub owner_username: String,
    pub attributes: BTreeMap<String, String>,
    pub dependencies: Vec<ModelResponse>,
}

impl From<ModelDetail> for ModelDetailResponse {
    fn from(detail: ModelDetail) -> Self {
        Self {
            model: detail.model.into(),
            owner_username: detail.owner_username,
            attributes: detail.attributes,
            dependencies: detail.dependencies.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct UpdateAccessRequest {
    pub access: ModelAccess,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct UpdateDefaultPermissionRequest {
    pub default_permission: DefaultPermission,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct ModelPermissionsResponse {
    pub access: ModelAccess,
    pub default_permission: DefaultPermission,
    pub owner_username: String,
    pub team_id: Option<TeamId>,
    pub caller_permission: ModelPermission,
}

// --- chunked model upload -------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct StartModelUploadRequest {
    pub model_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct StartModelUploadResponse {
    pub upload_id: UploadId,
    pub upload_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct CommitModelUploadResponse {
    pub model_id: ModelId,
}

// --- api keys -------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[oai(default)]
    pub model_ids: Vec<ModelId>,
    #[oai(default)]
    pub all_models: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct CreateApiKeyResponse {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct ApiKeyResponse {
    pub key_id: ApiKeyId,
    pub name: String,
    pub expires_at: DateTime<Utc>,
    pub all_models: bool,
    pub model_ids: Vec<ModelId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct DeleteApiKeyRequest {
    pub key_id: ApiKeyId,
}

// --- train api ------------------------------------------------------------

/// Where training input lives: a previous upload session or a path under the
/// shared storage root.
#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct DataSource {
    pub location: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Object)]
pub struct JobOptionsRequest {
    pub allocation_cores: Option<u64>,
    pub allocation_memory_mb: Option<u64>,
    pub allocation_memory_max_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct TrainRequest {
    pub model_name: String,
    pub data: Option<DataSource>,
    pub base_model_id: Option<ModelId>,
    #[oai(default)]
    pub job_options: JobOptionsRequest,
    /// Opaque options forwarded verbatim to the job binary.
    pub model_options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct TrainResponse {
    pub model_id: ModelId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct UploadDataResponse {
    pub upload_id: UploadId,
}

#[derive(Debug, Multipart)]
pub struct UploadDataPayload {
    pub files: Vec<MultipartUpload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct UpdateTrainStatusRequest {
    pub status: TrainStatus,
    pub attributes: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct UpdateDeployStatusRequest {
    pub status: DeployStatus,
    pub attributes: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct JobLogRequest {
    pub level: JobLogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct TrainStatusResponse {
    pub model_id: ModelId,
    pub train_status: TrainStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct JobLogEntryResponse {
    pub level: JobLogLevel,
    pub logged_at: DateTime<Utc>,
    pub message: String,
}

impl From<JobLogEntry> for JobLogEntryResponse {
    fn from(entry: JobLogEntry) -> Self {
        Self {
            level: entry.level,
            logged_at: entry.logged_at,
            message: entry.message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct JobLogsResponse {
    pub logs: Vec<JobLogEntryResponse>,
}

// --- deploy api -----------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, Object)]
pub struct DeployRequest {
    pub deployment_name: Option<String>,
    #[oai(default)]
    pub autoscaling_enabled: bool,
    pub autoscaling_min: Option<u32>,
    pub autoscaling_max: Option<u32>,
    pub memory: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct DeployResponse {
    pub model_id: ModelId,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct DeployStatusResponse {
    pub model_id: ModelId,
    pub deploy_status: DeployStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct SaveDeployedRequest {
    pub model_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct SaveDeployedResponse {
    pub model_id: ModelId,
}

// --- workflow api ---------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct EnterpriseSearchRequest {
    pub model_name: String,
    pub retrieval_id: ModelId,
    pub guardrail_id: Option<ModelId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct KnowledgeExtractionRequest {
    pub model_name: String,
    pub retrieval_id: ModelId,
    pub guardrail_id: Option<ModelId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct WorkflowResponse {
    pub model_id: ModelId,
}

// --- recovery / telemetry -------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct BackupResponse {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct BackupsResponse {
    pub backups: Vec<String>,
}

/// One entry of the Prometheus HTTP service-discovery payload.
#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct DiscoveryTarget {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct HealthcheckResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct EmptyResponse {}
