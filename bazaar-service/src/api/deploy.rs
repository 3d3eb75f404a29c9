use crate::api::{ApiResult, ApiTags};
use crate::model::{
    DeployRequest, DeployResponse, DeployStatusResponse, EmptyResponse, JobLogRequest,
    JobLogsResponse, SaveDeployedRequest, SaveDeployedResponse, UpdateDeployStatusRequest, User,
};
use crate::service::api_key::{looks_like_api_key, ApiKeyService};
use crate::service::auth::AuthService;
use crate::service::deploy::DeployService;
use bazaar_common::auth::{AuthToken, BazaarSecurityScheme};
use bazaar_common::model::{ModelId, ModelPermission};
use bazaar_common::recorded_http_api_request;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use std::sync::Arc;
use tracing::Instrument;

pub struct DeployApi {
    pub auth_service: Arc<dyn AuthService>,
    pub deploy_service: Arc<DeployService>,
    pub api_key_service: Arc<ApiKeyService>,
}

impl DeployApi {
    /// Deployment endpoints accept either a platform JWT or an API key as
    /// the bearer credential; the `mbk-` prefix tells them apart.
    async fn principal(
        &self,
        token: &AuthToken,
        model_id: &ModelId,
        required: ModelPermission,
    ) -> ApiResult<User> {
        if looks_like_api_key(&token.secret.value) {
            let user = self
                .api_key_service
                .authorize(&token.secret.value, model_id, required)
                .await?;
            token.principal.record(user.id);
            Ok(user)
        } else {
            let auth = self.auth_service.authorization(token).await?;
            Ok(auth.user)
        }
    }
}

#[OpenApi(prefix_path = "/api/v2/deploy", tag = ApiTags::Deploy)]
impl DeployApi {
    /// Binds a trained model to a long-lived service behind the ingress.
    /// Workflow models deploy their components first.
    #[oai(path = "/:model_id", method = "post", operation_id = "deploy_model")]
    async fn deploy(
        &self,
        model_id: Path<ModelId>,
        data: Json<DeployRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<DeployResponse>> {
        let record = recorded_http_api_request!("deploy_model", model_id = model_id.0.to_string());
        let response = async {
            let user = self
                .principal(token.token(), &model_id.0, ModelPermission::Owner)
                .await?;
            let endpoint = self
                .deploy_service
                .deploy(&user, &model_id.0, &data.0)
                .await?;
            Ok(Json(DeployResponse {
                model_id: model_id.0,
                endpoint,
            }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Stops the deployment and removes its ingress route.
    #[oai(path = "/:model_id", method = "delete", operation_id = "undeploy_model")]
    async fn undeploy(
        &self,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record =
            recorded_http_api_request!("undeploy_model", model_id = model_id.0.to_string());
        let response = async {
            let user = self
                .principal(token.token(), &model_id.0, ModelPermission::Owner)
                .await?;
            self.deploy_service.undeploy(&user, &model_id.0).await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/:model_id/status", method = "get", operation_id = "deploy_status")]
    async fn status(
        &self,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<DeployStatusResponse>> {
        let record = recorded_http_api_request!("deploy_status", model_id = model_id.0.to_string());
        let response = async {
            let user = self
                .principal(token.token(), &model_id.0, ModelPermission::Read)
                .await?;
            let status = self.deploy_service.status(&user, &model_id.0).await?;
            Ok(Json(DeployStatusResponse {
                model_id: model_id.0,
                deploy_status: status,
            }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/:model_id/logs", method = "get", operation_id = "deploy_logs")]
    async fn logs(
        &self,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<JobLogsResponse>> {
        let record = recorded_http_api_request!("deploy_logs", model_id = model_id.0.to_string());
        let response = async {
            let user = self
                .principal(token.token(), &model_id.0, ModelPermission::Read)
                .await?;
            let logs = self.deploy_service.logs(&user, &model_id.0).await?;
            Ok(Json(JobLogsResponse {
                logs: logs.into_iter().map(Into::into).collect(),
            }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Persists the live state of a deployment as a new model.
    #[oai(path = "/:model_id/save", method = "post", operation_id = "save_deployed")]
    async fn save(
        &self,
        model_id: Path<ModelId>,
        data: Json<SaveDeployedRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<SaveDeployedResponse>> {
        let record = recorded_http_api_request!("save_deployed", model_id = model_id.0.to_string());
        let response = async {
            let user = self
                .principal(token.token(), &model_id.0, ModelPermission::Read)
                .await?;
            let model = self
                .deploy_service
                .save(&user, &model_id.0, &data.0.model_name)
                .await?;
            Ok(Json(SaveDeployedResponse { model_id: model.id }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Job-only status callback, authorized by the job token.
    #[oai(
        path = "/update-status",
        method = "post",
        operation_id = "deploy_update_status"
    )]
    async fn update_status(
        &self,
        data: Json<UpdateDeployStatusRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("deploy_update_status");
        let response = async {
            let model_id = self.auth_service.job_authorization(token.token()).await?;
            self.deploy_service
                .update_status(&model_id, data.0.status, data.0.attributes.as_ref())
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Job-only log callback.
    #[oai(path = "/log", method = "post", operation_id = "deploy_log")]
    async fn log(
        &self,
        data: Json<JobLogRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("deploy_log");
        let response = async {
            let model_id = self.auth_service.job_authorization(token.token()).await?;
            self.deploy_service
                .record_log(&model_id, data.0.level, &data.0.message)
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }
}
