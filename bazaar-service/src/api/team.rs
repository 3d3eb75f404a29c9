use crate::api::{ApiResult, ApiTags};
use crate::model::{CreateTeamRequest, EmptyResponse, TeamMemberResponse, TeamResponse};
use crate::service::auth::AuthService;
use crate::service::team::TeamService;
use bazaar_common::auth::BazaarSecurityScheme;
use bazaar_common::model::{ModelId, TeamId, UserId};
use bazaar_common::recorded_http_api_request;
use poem_openapi::param::{Path, Query};
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use std::sync::Arc;
use tracing::Instrument;

pub struct TeamApi {
    pub auth_service: Arc<dyn AuthService>,
    pub team_service: Arc<TeamService>,
}

#[OpenApi(prefix_path = "/api/v2/team", tag = ApiTags::Team)]
impl TeamApi {
    #[oai(path = "/create", method = "post", operation_id = "create_team")]
    async fn create(
        &self,
        data: Json<CreateTeamRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<TeamResponse>> {
        let record = recorded_http_api_request!("create_team", name = data.0.name.clone());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            auth.ensure_admin()?;
            let team = self.team_service.create(&data.0.name).await?;
            Ok(Json(TeamResponse::from(team)))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/list", method = "get", operation_id = "list_teams")]
    async fn list(&self, token: BazaarSecurityScheme) -> ApiResult<Json<Vec<TeamResponse>>> {
        let record = recorded_http_api_request!("list_teams");
        let response = async {
            self.auth_service.authorization(token.token()).await?;
            let teams = self.team_service.list().await?;
            Ok(Json(teams.into_iter().map(TeamResponse::from).collect()))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/:team_id/users", method = "get", operation_id = "team_members")]
    async fn members(
        &self,
        team_id: Path<TeamId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<Vec<TeamMemberResponse>>> {
        let record = recorded_http_api_request!("team_members", team_id = team_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.team_service
                .ensure_member(&auth.user, &team_id.0)
                .await?;
            let members = self.team_service.members(&team_id.0).await?;
            Ok(Json(
                members.into_iter().map(TeamMemberResponse::from).collect(),
            ))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(
        path = "/:team_id/users/:user_id",
        method = "post",
        operation_id = "add_team_member"
    )]
    async fn add_member(
        &self,
        team_id: Path<TeamId>,
        user_id: Path<UserId>,
        team_admin: Query<Option<bool>>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!(
            "add_team_member",
            team_id = team_id.0.to_string(),
            user_id = user_id.0.to_string()
        );
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.team_service
                .add_member(
                    &auth.user,
                    &team_id.0,
                    &user_id.0,
                    team_admin.0.unwrap_or(false),
                )
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(
        path = "/:team_id/users/:user_id",
        method = "delete",
        operation_id = "remove_team_member"
    )]
    async fn remove_member(
        &self,
        team_id: Path<TeamId>,
        user_id: Path<UserId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!(
            "remove_team_member",
            team_id = team_id.0.to_string(),
            user_id = user_id.0.to_string()
        );
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.team_service
                .remove_member(&auth.user, &team_id.0, &user_id.0)
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(
        path = "/:team_id/users/:user_id/admin",
        method = "post",
        operation_id = "promote_team_admin"
    )]
    async fn promote_team_admin(
        &self,
        team_id: Path<TeamId>,
        user_id: Path<UserId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!(
            "promote_team_admin",
            team_id = team_id.0.to_string(),
            user_id = user_id.0.to_string()
        );
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.team_service
                .set_team_admin(&auth.user, &team_id.0, &user_id.0, true)
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(
        path = "/:team_id/users/:user_id/admin",
        method = "delete",
        operation_id = "demote_team_admin"
    )]
    async fn demote_team_admin(
        &self,
        team_id: Path<TeamId>,
        user_id: Path<UserId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!(
            "demote_team_admin",
            team_id = team_id.0.to_string(),
            user_id = user_id.0.to_string()
        );
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.team_service
                .set_team_admin(&auth.user, &team_id.0, &user_id.0, false)
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Shares a model with a team; needs team-admin rights and model
    /// ownership.
    #[oai(
        path = "/:team_id/models/:model_id",
        method = "post",
        operation_id = "add_team_model"
    )]
    async fn add_model(
        &self,
        team_id: Path<TeamId>,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!(
            "add_team_model",
            team_id = team_id.0.to_string(),
            model_id = model_id.0.to_string()
        );
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.team_service
                .add_model(&auth.user, &team_id.0, &model_id.0)
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(
        path = "/:team_id/models/:model_id",
        method = "delete",
        operation_id = "remove_team_model"
    )]
    async fn remove_model(
        &self,
        team_id: Path<TeamId>,
        model_id: Path<ModelId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!(
            "remove_team_model",
            team_id = team_id.0.to_string(),
            model_id = model_id.0.to_string()
        );
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.team_service
                .remove_model(&auth.user, &team_id.0, &model_id.0)
                .await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }
}
