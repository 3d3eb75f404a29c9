use crate::api::{ApiResult, ApiTags};
use crate::model::HealthcheckResponse;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;

pub struct HealthcheckApi;

#[OpenApi(prefix_path = "/api/v2/health", tag = ApiTags::Health)]
impl HealthcheckApi {
    #[oai(path = "/", method = "get", operation_id = "healthcheck")]
    async fn healthcheck(&self) -> ApiResult<Json<HealthcheckResponse>> {
        Ok(Json(HealthcheckResponse {
            status: "ok".to_string(),
        }))
    }
}
