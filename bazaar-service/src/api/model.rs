use crate::api::{ApiError, ApiResult, ApiTags};
use crate::model::{
    ApiKeyResponse, CommitModelUploadResponse, CreateApiKeyRequest, CreateApiKeyResponse,
    DeleteApiKeyRequest, EmptyResponse, ModelDetailResponse, ModelPermissionsResponse,
    ModelResponse, StartModelUploadRequest, StartModelUploadResponse, UpdateAccessRequest,
    UpdateDefaultPermissionRequest,
};
use crate::service::api_key::ApiKeyService;
use crate::service::auth::AuthService;
use crate::service::model::ModelService;
use crate::service::upload::UploadService;
use bazaar_common::auth::BazaarSecurityScheme;
use bazaar_common::model::ModelId;
use bazaar_common::recorded_http_api_request;
use poem::Body;
use poem_openapi::param::Path;
use poem_openapi::payload::{Binary, Json};
use poem_openapi::OpenApi;
use std::sync::Arc;
use tracing::Instrument;

pub struct ModelApi {
    pub auth_service: Arc<dyn AuthService>,
    pub model_service: Arc<ModelService>,
    pub upload_service: Arc<UploadService>,
    pub api_key_service: Arc<ApiKeyService>,
}

#[OpenApi(prefix_path = "/api/v2/model", tag = ApiTags::Model)]
impl ModelApi {
    #[oai(path = "/list", method = "get", operation_id = "list_models")]
    async fn list(&self, token: BazaarSecurityScheme) -> ApiResult<Json<Vec<ModelResponse>>> {
        let record = recorded_http_api_request!("list_models");
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let models = self.model_service.list(&auth.user).await?;
            Ok(Json(models.into_iter().map(ModelResponse::from).collect()))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Full model detail including attributes and dependencies.
    #[oai(path = "/:model_id", method = "get", operation_id = "get_model")]
    async fn get(
        &self,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<ModelDetailResponse>> {
        let record = recorded_http_api_request!("get_model", model_id = model_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let detail = self
                .model_service
                .get_detail(&auth.user, &model_id.0)
                .await?;
            Ok(Json(ModelDetailResponse::from(detail)))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Owner-only delete; refused while other models depend on this one.
    #[oai(path = "/:model_id", method = "delete", operation_id = "delete_model")]
    async fn delete(
        &self,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("delete_model", model_id = model_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.model_service.delete(&auth.user, &model_id.0).await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/:model_id/access", method = "post", operation_id = "update_access")]
    async fn update_access(
        &self,
        model_id: Path<ModelId>,
        data: Json<UpdateAccessRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("update_access", model_id = model_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.model_service
                .set_access(&auth.user, &model_id.0, data.0.access)
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(
        path = "/:model_id/default-permission",
        method = "post",
        operation_id = "update_default_permission"
    )]
    async fn update_default_permission(
        &self,
        model_id: Path<ModelId>,
        data: Json<UpdateDefaultPermissionRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!(
            "update_default_permission",
            model_id = model_id.0.to_string()
        );
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.model_service
                .set_default_permission(&auth.user, &model_id.0, data.0.default_permission)
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(
        path = "/:model_id/permissions",
        method = "get",
        operation_id = "model_permissions"
    )]
    async fn permissions(
        &self,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<ModelPermissionsResponse>> {
        let record =
            recorded_http_api_request!("model_permissions", model_id = model_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let view = self
                .model_service
                .permissions_view(&auth.user, &model_id.0)
                .await?;
            Ok(Json(view))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Streams the model artifacts as a zip archive.
    #[oai(path = "/:model_id/download", method = "get", operation_id = "download_model")]
    async fn download(
        &self,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Binary<Body>> {
        let record =
            recorded_http_api_request!("download_model", model_id = model_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let (_filename, stream) = self
                .model_service
                .download(&auth.user, &model_id.0)
                .await?;
            Ok(Binary(Body::from_bytes_stream(stream)))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Opens a chunked import session for an externally trained model.
    #[oai(path = "/upload", method = "post", operation_id = "start_model_upload")]
    async fn start_upload(
        &self,
        data: Json<StartModelUploadRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<StartModelUploadResponse>> {
        let record =
            recorded_http_api_request!("start_model_upload", name = data.0.model_name.clone());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let (upload_id, upload_token) = self
                .upload_service
                .start_model_upload(&auth.user, &data.0.model_name)
                .await?;
            Ok(Json(StartModelUploadResponse {
                upload_id,
                upload_token,
            }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Stores one chunk; authorized by the session's upload token.
    #[oai(path = "/upload/:chunk_idx", method = "post", operation_id = "upload_chunk")]
    async fn upload_chunk(
        &self,
        chunk_idx: Path<u32>,
        content: Binary<Vec<u8>>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("upload_chunk", chunk_idx = chunk_idx.0);
        let response = async {
            let upload_id = self
                .auth_service
                .upload_authorization(token.token())
                .await?;
            self.upload_service
                .put_chunk(&upload_id, chunk_idx.0, &content.0)
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Assembles the chunks, expands the archive and registers the model as
    /// trained.
    #[oai(path = "/upload/commit", method = "post", operation_id = "commit_model_upload")]
    async fn commit_upload(
        &self,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<CommitModelUploadResponse>> {
        let record = recorded_http_api_request!("commit_model_upload");
        let response = async {
            let upload_id = self
                .auth_service
                .upload_authorization(token.token())
                .await?;
            let model = self.upload_service.commit(&upload_id).await?;
            Ok(Json(CommitModelUploadResponse { model_id: model.id }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Creates an API key; the plaintext is returned exactly once.
    #[oai(path = "/create-api-key", method = "post", operation_id = "create_api_key")]
    async fn create_api_key(
        &self,
        data: Json<CreateApiKeyRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<CreateApiKeyResponse>> {
        let record = recorded_http_api_request!("create_api_key", name = data.0.name.clone());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            if data.0.model_ids.is_empty() && !data.0.all_models {
                return Err(ApiError::bad_request(
                    "an api key needs model_ids or all_models",
                ));
            }
            let api_key = self
                .api_key_service
                .create(
                    &auth.user,
                    &data.0.name,
                    &data.0.model_ids,
                    data.0.all_models,
                    data.0.expires_at,
                )
                .await?;
            Ok(Json(CreateApiKeyResponse { api_key }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Keys owned by the caller; secrets are never returned.
    #[oai(path = "/list-api-keys", method = "get", operation_id = "list_api_keys")]
    async fn list_api_keys(
        &self,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<Vec<ApiKeyResponse>>> {
        let record = recorded_http_api_request!("list_api_keys");
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let keys = self.api_key_service.list(&auth.user.id).await?;
            Ok(Json(
                keys.into_iter()
                    .map(|(key, model_ids)| ApiKeyResponse {
                        key_id: key.id,
                        name: key.name,
                        expires_at: key.expires_at,
                        all_models: key.all_models,
                        model_ids,
                    })
                    .collect(),
            ))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/delete-api-key", method = "post", operation_id = "delete_api_key")]
    async fn delete_api_key(
        &self,
        data: Json<DeleteApiKeyRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record =
            recorded_http_api_request!("delete_api_key", key_id = data.0.key_id.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            if !self
                .api_key_service
                .delete(&auth.user.id, &data.0.key_id)
                .await?
            {
                return Err(ApiError::not_found("api key not found"));
            }
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }
}
