use crate::api::{ApiResult, ApiTags};
use crate::model::{BackupResponse, BackupsResponse};
use crate::service::auth::AuthService;
use crate::service::recovery::RecoveryService;
use bazaar_common::auth::BazaarSecurityScheme;
use bazaar_common::recorded_http_api_request;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use std::sync::Arc;
use tracing::Instrument;

pub struct RecoveryApi {
    pub auth_service: Arc<dyn AuthService>,
    pub recovery_service: Arc<RecoveryService>,
}

#[OpenApi(prefix_path = "/api/v2/recovery", tag = ApiTags::Recovery)]
impl RecoveryApi {
    /// Snapshots the artifact tree into the backups prefix.
    #[oai(path = "/backup", method = "post", operation_id = "create_backup")]
    async fn backup(&self, token: BazaarSecurityScheme) -> ApiResult<Json<BackupResponse>> {
        let record = recorded_http_api_request!("create_backup");
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            auth.ensure_admin()?;
            let path = self.recovery_service.backup().await?;
            Ok(Json(BackupResponse { path }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/backups", method = "get", operation_id = "list_backups")]
    async fn list(&self, token: BazaarSecurityScheme) -> ApiResult<Json<BackupsResponse>> {
        let record = recorded_http_api_request!("list_backups");
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            auth.ensure_admin()?;
            let backups = self.recovery_service.list().await?;
            Ok(Json(BackupsResponse { backups }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }
}
