use crate::api::{ApiResult, ApiTags};
use crate::model::{
    CreateUserRequest, EmptyResponse, LoginResponse, LoginWithTokenRequest, SignupRequest,
    SignupResponse, UserResponse,
};
use crate::service::auth::AuthService;
use crate::service::user::UserService;
use bazaar_common::auth::{BasicSecurityScheme, BazaarSecurityScheme};
use bazaar_common::model::UserId;
use bazaar_common::recorded_http_api_request;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use std::sync::Arc;
use tracing::Instrument;

pub struct UserApi {
    pub auth_service: Arc<dyn AuthService>,
    pub user_service: Arc<UserService>,
}

#[OpenApi(prefix_path = "/api/v2/user", tag = ApiTags::User)]
impl UserApi {
    /// Local signup; only available with the basic identity provider.
    #[oai(path = "/signup", method = "post", operation_id = "signup")]
    async fn signup(&self, data: Json<SignupRequest>) -> ApiResult<Json<SignupResponse>> {
        let record = recorded_http_api_request!("signup", username = data.0.username.clone());
        let response = async {
            let user = self
                .user_service
                .signup(&data.0.username, &data.0.email, &data.0.password)
                .await?;
            Ok(Json(SignupResponse { user_id: user.id }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Exchange HTTP basic credentials for a platform JWT.
    #[oai(path = "/login", method = "get", operation_id = "login")]
    async fn login(&self, credentials: BasicSecurityScheme) -> ApiResult<Json<LoginResponse>> {
        let record = recorded_http_api_request!("login");
        let response = async {
            let (user, access_token) = self
                .user_service
                .login(&credentials.0.username, &credentials.0.password)
                .await?;
            Ok(Json(LoginResponse {
                user_id: user.id,
                access_token,
            }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Exchange an identity-provider access token for a platform JWT.
    #[oai(
        path = "/login-with-token",
        method = "post",
        operation_id = "login_with_token"
    )]
    async fn login_with_token(
        &self,
        data: Json<LoginWithTokenRequest>,
    ) -> ApiResult<Json<LoginResponse>> {
        let record = recorded_http_api_request!("login_with_token");
        let response = async {
            let (user, access_token) = self
                .user_service
                .login_with_token(&data.0.access_token)
                .await?;
            Ok(Json(LoginResponse {
                user_id: user.id,
                access_token,
            }))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Users visible to the caller: everyone for admins, team colleagues
    /// otherwise.
    #[oai(path = "/list", method = "get", operation_id = "list_users")]
    async fn list(&self, token: BazaarSecurityScheme) -> ApiResult<Json<Vec<UserResponse>>> {
        let record = recorded_http_api_request!("list_users");
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            let users = self.user_service.list(&auth.user).await?;
            Ok(Json(users.into_iter().map(UserResponse::from).collect()))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/create", method = "post", operation_id = "create_user")]
    async fn create(
        &self,
        data: Json<CreateUserRequest>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<UserResponse>> {
        let record = recorded_http_api_request!("create_user", username = data.0.username.clone());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            auth.ensure_admin()?;
            let user = self
                .user_service
                .create_user(
                    &data.0.username,
                    &data.0.email,
                    data.0.password.as_deref(),
                    data.0.is_admin,
                )
                .await?;
            Ok(Json(UserResponse::from(user)))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Deletes the caller's own account.
    #[oai(path = "/self", method = "delete", operation_id = "delete_self")]
    async fn delete_self(&self, token: BazaarSecurityScheme) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("delete_self");
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            self.user_service.delete(&auth.user.id).await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/:user_id", method = "delete", operation_id = "delete_user")]
    async fn delete(
        &self,
        user_id: Path<UserId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("delete_user", user_id = user_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            auth.ensure_admin()?;
            self.user_service.delete(&user_id.0).await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/:user_id/admin", method = "post", operation_id = "promote_admin")]
    async fn promote_admin(
        &self,
        user_id: Path<UserId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("promote_admin", user_id = user_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            auth.ensure_admin()?;
            self.user_service.set_admin(&user_id.0, true).await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    /// Demotes an admin; refused when it would leave the platform without
    /// one.
    #[oai(path = "/:user_id/admin", method = "delete", operation_id = "demote_admin")]
    async fn demote_admin(
        &self,
        user_id: Path<UserId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("demote_admin", user_id = user_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            auth.ensure_admin()?;
            self.user_service.set_admin(&user_id.0, false).await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }

    #[oai(path = "/:user_id/verify", method = "post", operation_id = "verify_user")]
    async fn verify(
        &self,
        user_id: Path<UserId>,
        token: BazaarSecurityScheme,
    ) -> ApiResult<Json<EmptyResponse>> {
        let record = recorded_http_api_request!("verify_user", user_id = user_id.0.to_string());
        let response = async {
            let auth = self.auth_service.authorization(token.token()).await?;
            auth.ensure_admin()?;
            self.user_service.verify(&user_id.0).await?;
            Ok(Json(EmptyResponse {}))
        }
        .instrument(record.span.clone())
        .await;
        record.result(response)
    }
}
