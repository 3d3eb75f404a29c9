use crate::api::{ApiResult, ApiTags};
use crate::model::{EnterpriseSearchRequest, KnowledgeExtractionRequest, WorkflowResponse};
use crate::service::auth::AuthService;
use crate::service::workflow::WorkflowService;
use bazaar_common::auth::BazaarSecurityScheme;
use bazaar_common::recorded_http_api_request;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use std::sync::Arc;
use tracing::Instrument;

pub struct WorkflowApi {
    pub auth_service: Arc<dyn AuthService>,
    pub workflow_service: Arc<WorkflowService>,
}

#[OpenApi(prefix_path = "/api/v2/workflow", tag = ApiTags::Workflow)]
impl WorkflowApi {
    /// Composes a retrieval model and an optional guardrail into an
    /// enterprise-search workflow.
    #[oai(
        path = "/enterprise-search",
        method = "post",
        operation_id = "create_enterprise_search"
    )]
    async fn enterprise_search(
        &self,
        data: Json<EnterpriseSearchRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<WorkflowResponse>> {
        let record =
            recorded_http_api_request!("create_enterprise_search", name = data.0.model_name.clone());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let workflow = self
                .workflow_service
                .create_enterprise_search(
                    &auth.user,
                    &data.0.model_name,
                    &data.0.retrieval_id,
                    data.0.guardrail_id.as_ref(),
                )
                .await?;
            Ok(Json(WorkflowResponse {
                model_id: workflow.id,
            }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(
        path = "/knowledge-extraction",
        method = "post",
        operation_id = "create_knowledge_extraction"
    )]
    async fn knowledge_extraction(
        &self,
        data: Json<KnowledgeExtractionRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<WorkflowResponse>> {
        let record = recorded_http_api_request!(
            "create_knowledge_extraction",
            name = data.0.model_name.clone()
        );
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let workflow = self
                .workflow_service
                .create_knowledge_extraction(
                    &auth.user,
                    &data.0.model_name,
                    &data.0.retrieval_id,
                    data.0.guardrail_id.as_ref(),
                )
                .await?;
            Ok(Json(WorkflowResponse {
                model_id: workflow.id,
            }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }
}
