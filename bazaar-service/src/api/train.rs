use crate::api::{ApiResult, ApiTags};
use crate::model::{
    EmptyResponse, JobLogRequest, JobLogsResponse, TrainRequest, TrainResponse,
    TrainStatusResponse, UpdateTrainStatusRequest, UploadDataPayload, UploadDataResponse,
};
use crate::service::auth::AuthService;
use crate::service::train::TrainService;
use crate::service::upload::UploadService;
use bazaar_common::auth::BazaarSecurityScheme;
use bazaar_common::model::{ModelId, ModelType};
use bazaar_common::recorded_http_api_request;
use poem_openapi::param::Path;
use poem_openapi::payload::{Binary, Json};
use poem_openapi::OpenApi;
use std::sync::Arc;
use tracing::Instrument;

pub struct TrainApi {
    pub auth_service: Arc<dyn AuthService>,
    pub train_service: Arc<TrainService>,
    pub upload_service: Arc<UploadService>,
}

impl TrainApi {
    async fn start_train(
        &self,
        token: &BazaarSecurityScheme,
        model_type: ModelType,
        task: &str,
        request: TrainRequest,
        base_model_required: bool,
    ) -> ApiResult<Json<TrainResponse>> {
        let auth = self.auth_service.authorization(token.token()).await?;
        let model = self
            .train_service
            .start(&auth.user, model_type, task, &request, base_model_required)
            .await?;
        Ok(Json(TrainResponse { model_id: model.id }))
    }
}

#[OpenApi(prefix_path = "/api/v2/train", tag = ApiTags::Train)]
impl TrainApi {
    /// Trains a new neural database model.
    #[oai(path = "/ndb", method = "post", operation_id = "train_ndb")]
    async fn train_ndb(
        &self,
        data: Json<TrainRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record = recorded_http_api_request!("train_ndb", name = data.0.model_name.clone());
        let response = self
            .start_train(&token, ModelType::Ndb, "train", data.0, false)
            .instrument(record.span.clone())
            .await;
        record.result(response)
    }

    #[oai(path = "/nlp-token", method = "post", operation_id = "train_nlp_token")]
    async fn train_nlp_token(
        &self,
        data: Json<TrainRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record =
            recorded_http_api_request!("train_nlp_token", name = data.0.model_name.clone());
        let response = self
            .start_train(&token, ModelType::NlpToken, "train", data.0, false)
            .instrument(record.span.clone())
            .await;
        record.result(response)
    }

    #[oai(path = "/nlp-text", method = "post", operation_id = "train_nlp_text")]
    async fn train_nlp_text(
        &self,
        data: Json<TrainRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record = recorded_http_api_request!("train_nlp_text", name = data.0.model_name.clone());
        let response = self
            .start_train(&token, ModelType::NlpText, "train", data.0, false)
            .instrument(record.span.clone())
            .await;
        record.result(response)
    }

    /// Generates synthetic training data with an LLM, then trains on it.
    #[oai(path = "/nlp-datagen", method = "post", operation_id = "train_nlp_datagen")]
    async fn train_nlp_datagen(
        &self,
        data: Json<TrainRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record =
            recorded_http_api_request!("train_nlp_datagen", name = data.0.model_name.clone());
        let response = self
            .start_train(&token, ModelType::NlpText, "datagen", data.0, false)
            .instrument(record.span.clone())
            .await;
        record.result(response)
    }

    /// Continues training from an existing NDB model into a new model row.
    #[oai(path = "/ndb-retrain", method = "post", operation_id = "retrain_ndb")]
    async fn retrain_ndb(
        &self,
        data: Json<TrainRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record = recorded_http_api_request!("retrain_ndb", name = data.0.model_name.clone());
        let response = self
            .start_train(&token, ModelType::Ndb, "retrain", data.0, true)
            .instrument(record.span.clone())
            .await;
        record.result(response)
    }

    #[oai(
        path = "/nlp-token-retrain",
        method = "post",
        operation_id = "retrain_nlp_token"
    )]
    async fn retrain_nlp_token(
        &self,
        data: Json<TrainRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<TrainResponse>> {
        let record =
            recorded_http_api_request!("retrain_nlp_token", name = data.0.model_name.clone());
        let response = self
            .start_train(&token, ModelType::NlpToken, "retrain", data.0, true)
            .instrument(record.span.clone())
            .await;
        record.result(response)
    }

    /// Multipart upload of training input files.
    #[oai(path = "/upload-data", method = "post", operation_id = "upload_train_data")]
    async fn upload_data(
        &self,
        payload: UploadDataPayload,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<UploadDataResponse>> {
        let record = recorded_http_api_request!("upload_train_data");
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let mut files = Vec::new();
            for upload in payload.files {
                let filename = upload
                    .file_name()
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| format!("file-{}", files.len()));
                let content = upload
                    .into_vec()
                    .await
                    .map_err(|e| crate::api::ApiError::bad_request(e.to_string()))?;
                files.push((filename, content));
            }
            let upload_id = self
                .upload_service
                .upload_train_data(&auth.user, files)
                .await?;
            Ok(Json(UploadDataResponse { upload_id }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/:model_id/status", method = "get", operation_id = "train_status")]
    async fn status(
        &self,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<TrainStatusResponse>> {
        let record = recorded_http_api_request!("train_status", model_id = model_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let status = self.train_service.status(&auth.user, &model_id.0).await?;
            Ok(Json(TrainStatusResponse {
                model_id: model_id.0,
                train_status: status,
            }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Warnings and errors the training job reported.
    #[oai(path = "/:model_id/logs", method = "get", operation_id = "train_logs")]
    async fn logs(
        &self,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<JobLogsResponse>> {
        let record = recorded_http_api_request!("train_logs", model_id = model_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let logs = self.train_service.logs(&auth.user, &model_id.0).await?;
            Ok(Json(JobLogsResponse {
                logs: logs.into_iter().map(Into::into).collect(),
            }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// The evaluation report the training job wrote, verbatim.
    #[oai(path = "/:model_id/report", method = "get", operation_id = "train_report")]
    async fn report(
        &self,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Binary<Vec<u8>>> {
        let record = recorded_http_api_request!("train_report", model_id = model_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let report = self.train_service.report(&auth.user, &model_id.0).await?;
            Ok(Binary(report))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Stops a running training; the model ends in `stopped`.
    #[oai(path = "/:model_id/stop", method = "post", operation_id = "stop_train")]
    async fn stop(
        &self,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("stop_train", model_id = model_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.train_service.stop(&auth.user, &model_id.0).await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Job-only status callback, authorized by the job token.
    #[oai(path = "/update-status", method = "post", operation_id = "train_update_status")]
    async fn update_status(
        &self,
        data: Json<UpdateTrainStatusRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("train_update_status");
        let response = async {
            let model_id = self.auth_service.job_authorization(token.token()).await?;
            self.train_service
                .update_status(&model_id, data.0.status, data.0.attributes.as_ref())
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Job-only log callback.
    #[oai(path = "/log", method = "post", operation_id = "train_log")]
    async fn log(
        &self,
        data: Json<JobLogRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("train_log");
        let response = async {
            let model_id = self.auth_service.job_authorization(token.token()).await?;
            self.train_service
                .record_log(&model_id, data.0.level, &data.0.message)
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }
}
