use crate::api::{ApiResult, ApiTags};
use crate::model::DiscoveryTarget;
use bazaar_common::recorded_http_api_request;
use bazaar_service_base::orchestrator::Orchestrator;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::Instrument;

pub struct TelemetryApi {
    pub orchestrator: Arc<dyn Orchestrator>,
}

#[OpenApi(prefix_path = "/api/v2/telemetry", tag = ApiTags::Telemetry)]
impl TelemetryApi {
    /// Prometheus HTTP service discovery over active deployments. Served to
    /// the cluster-internal scraper, which cannot carry platform
    /// credentials.
    #[oai(
        path = "/deployment-services",
        method = "get",
        operation_id = "deployment_services"
    )]
    async fn deployment_services(&self) -> ApiResult<Json<Vec<DiscoveryTarget>>> {
        let record = recorded_http_api_request!("deployment_services");
        let response = async {
            let services = self.orchestrator.services().await?;
            let targets = services
                .into_iter()
                .map(|service| DiscoveryTarget {
                    targets: service
                        .allocations
                        .iter()
                        .map(|allocation| format!("{}:{}", allocation.address, allocation.port))
                        .collect(),
                    labels: BTreeMap::from([
                        ("job".to_string(), service.name.clone()),
                        (
                            "orchestrator".to_string(),
                            self.orchestrator.name().to_string(),
                        ),
                    ]),
                })
                .collect();
            Ok(Json(targets))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }
}
