use crate::config::BazaarConfig;
use crate::repo;
use crate::service::api_key::ApiKeyService;
use crate::service::audit::AuditLog;
use crate::service::auth::{AuthService, AuthServiceDefault};
use crate::service::deploy::DeployService;
use crate::service::identity::basic::BasicIdentityProvider;
use crate::service::identity::keycloak::KeycloakIdentityProvider;
use crate::service::identity::IdentityProvider;
use crate::service::job::platform::PlatformJobs;
use crate::service::job::JobLauncher;
use crate::service::license::LicenseService;
use crate::service::model::ModelService;
use crate::service::permission::PermissionService;
use crate::service::reconciler::Reconciler;
use crate::service::recovery::RecoveryService;
use crate::service::team::TeamService;
use crate::service::token::TokenService;
use crate::service::train::TrainService;
use crate::service::upload::UploadService;
use crate::service::user::UserService;
use crate::service::workflow::WorkflowService;
use bazaar_service_base::orchestrator::kubernetes::{KubernetesConfig, KubernetesOrchestrator};
use bazaar_service_base::orchestrator::nomad::{NomadConfig, NomadOrchestrator};
use bazaar_service_base::orchestrator::Orchestrator;
use bazaar_service_base::storage::fs::FsStorage;
use bazaar_service_base::storage::SharedStorage;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub auth_service: Arc<dyn AuthService>,
    pub user_service: Arc<UserService>,
    pub team_service: Arc<TeamService>,
    pub model_service: Arc<ModelService>,
    pub train_service: Arc<TrainService>,
    pub deploy_service: Arc<DeployService>,
    pub workflow_service: Arc<WorkflowService>,
    pub api_key_service: Arc<ApiKeyService>,
    pub upload_service: Arc<UploadService>,
    pub recovery_service: Arc<RecoveryService>,
    pub audit_log: Arc<AuditLog>,
    pub platform_jobs: Arc<PlatformJobs>,
    pub reconciler: Arc<Reconciler>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub storage: Arc<dyn SharedStorage>,
}

impl Services {
    pub async fn new(config: &BazaarConfig, db_pool: PgPool) -> Result<Self, String> {
        let storage: Arc<dyn SharedStorage> = Arc::new(
            FsStorage::new(config.share_dir.clone())
                .await
                .map_err(|e| format!("shared storage init: {e}"))?,
        );

        let orchestrator: Arc<dyn Orchestrator> = if config.orchestrator.kubernetes_enabled() {
            Arc::new(
                KubernetesOrchestrator::new(KubernetesConfig {
                    namespace: config.orchestrator.namespace.clone(),
                    ingress_hostname: config.ingress_hostname.clone(),
                })
                .await
                .map_err(|e| format!("kubernetes orchestrator init: {e}"))?,
            )
        } else {
            let endpoint = config
                .orchestrator
                .nomad_endpoint
                .clone()
                .ok_or_else(|| "no orchestrator configured".to_string())?;
            Arc::new(
                NomadOrchestrator::new(NomadConfig {
                    endpoint,
                    token: config.orchestrator.nomad_token.clone(),
                    datacenter: config.orchestrator.datacenter.clone(),
                    ingress_hostname: config.ingress_hostname.clone(),
                    request_timeout: config.orchestrator.request_timeout,
                })
                .map_err(|e| format!("nomad orchestrator init: {e}"))?,
            )
        };

        let user_repo: Arc<dyn repo::user::UserRepo> =
            Arc::new(repo::user::DbUserRepo::new(db_pool.clone()));
        let team_repo: Arc<dyn repo::team::TeamRepo> =
            Arc::new(repo::team::DbTeamRepo::new(db_pool.clone()));
        let model_repo: Arc<dyn repo::model::ModelRepo> =
            Arc::new(repo::model::DbModelRepo::new(db_pool.clone()));
        let api_key_repo: Arc<dyn repo::api_key::ApiKeyRepo> =
            Arc::new(repo::api_key::DbApiKeyRepo::new(db_pool.clone()));
        let upload_repo: Arc<dyn repo::upload::UploadRepo> =
            Arc::new(repo::upload::DbUploadRepo::new(db_pool.clone()));

        let tokens = Arc::new(TokenService::new(&config.jwt, config.identity.token_ttl));

        let license = Arc::new(
            LicenseService::load(&config.license).map_err(|e| format!("license init: {e}"))?,
        );

        let launcher = Arc::new(JobLauncher::new(
            orchestrator.clone(),
            storage.clone(),
            license.clone(),
            tokens.clone(),
            config.driver.clone(),
            config.public_endpoint.clone(),
        ));

        let permissions = Arc::new(PermissionService::new(
            model_repo.clone(),
            team_repo.clone(),
        ));

        let identity: Arc<dyn IdentityProvider> = match config.identity.provider.as_str() {
            "keycloak" => Arc::new(
                KeycloakIdentityProvider::new(
                    user_repo.clone(),
                    config.identity.keycloak.clone(),
                )
                .map_err(|e| format!("keycloak init: {e}"))?,
            ),
            _ => Arc::new(BasicIdentityProvider::new(user_repo.clone())),
        };

        let auth_service: Arc<dyn AuthService> =
            Arc::new(AuthServiceDefault::new(user_repo.clone(), tokens.clone()));

        let model_service = Arc::new(ModelService::new(
            model_repo.clone(),
            user_repo.clone(),
            permissions.clone(),
            storage.clone(),
            launcher.clone(),
        ));

        let user_service = Arc::new(UserService::new(
            user_repo.clone(),
            team_repo.clone(),
            identity.clone(),
            tokens.clone(),
            model_service.clone(),
        ));

        let team_service = Arc::new(TeamService::new(team_repo.clone(), model_repo.clone()));

        let train_service = Arc::new(TrainService::new(
            model_repo.clone(),
            upload_repo.clone(),
            permissions.clone(),
            launcher.clone(),
            storage.clone(),
        ));

        let deploy_service = Arc::new(DeployService::new(
            model_repo.clone(),
            permissions.clone(),
            launcher.clone(),
            storage.clone(),
        ));

        let workflow_service = Arc::new(WorkflowService::new(
            model_repo.clone(),
            permissions.clone(),
        ));

        let api_key_service = Arc::new(ApiKeyService::new(
            api_key_repo.clone(),
            user_repo.clone(),
            permissions.clone(),
        ));

        let upload_service = Arc::new(UploadService::new(
            upload_repo.clone(),
            model_repo.clone(),
            storage.clone(),
            tokens.clone(),
            config.uploads.session_ttl,
        ));

        let recovery_service = Arc::new(RecoveryService::new(storage.clone()));

        let audit_log = Arc::new(AuditLog::new(storage.clone()));

        let platform_jobs = Arc::new(PlatformJobs::new(
            launcher.clone(),
            storage.clone(),
            config.platform.clone(),
            config.public_endpoint.clone(),
            config.grafana_db_url.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(
            model_repo.clone(),
            orchestrator.clone(),
            config.reconciler.clone(),
        ));

        Ok(Self {
            auth_service,
            user_service,
            team_service,
            model_service,
            train_service,
            deploy_service,
            workflow_service,
            api_key_service,
            upload_service,
            recovery_service,
            audit_log,
            platform_jobs,
            reconciler,
            orchestrator,
            storage,
        })
    }
}
