use crate::fakes::{test_model, test_user};
use bazaar_common::model::ModelType;
use bazaar_service::config::{DriverConfig, JwtConfig, PlatformJobsConfig};
use bazaar_service::model::JobOptionsRequest;
use bazaar_service::service::job::platform::{PlatformJobs, PROMETHEUS_CONFIG_PATH};
use bazaar_service::service::job::{DeploySettings, JobLauncher};
use bazaar_service::service::license::{LicenseClaims, LicenseService};
use bazaar_service::service::token::TokenService;
use bazaar_service_base::orchestrator::memory::InMemoryOrchestrator;
use bazaar_service_base::orchestrator::{JobDriver, JobState, Orchestrator};
use bazaar_service_base::storage::memory::InMemoryStorage;
use bazaar_service_base::storage::SharedStorage;
use chrono::Utc;
use std::sync::Arc;
use test_r::test;

struct Fixture {
    orchestrator: Arc<InMemoryOrchestrator>,
    storage: Arc<InMemoryStorage>,
    tokens: Arc<TokenService>,
    launcher: Arc<JobLauncher>,
}

fn fixture(driver: DriverConfig, license: LicenseService) -> Fixture {
    let orchestrator = Arc::new(InMemoryOrchestrator::new("bazaar.example.com"));
    let storage = Arc::new(InMemoryStorage::new());
    let tokens = Arc::new(TokenService::new(
        &JwtConfig::default(),
        std::time::Duration::from_secs(900),
    ));
    let launcher = Arc::new(JobLauncher::new(
        orchestrator.clone(),
        storage.clone(),
        Arc::new(license),
        tokens.clone(),
        driver,
        "http://bazaar.internal:8080".to_string(),
    ));
    Fixture {
        orchestrator,
        storage,
        tokens,
        launcher,
    }
}

fn docker_driver() -> DriverConfig {
    DriverConfig {
        mode: "docker".to_string(),
        tag: Some("v1".to_string()),
        ..DriverConfig::default()
    }
}

#[test]
async fn train_launch_writes_config_and_job_token() {
    let fixture = fixture(docker_driver(), LicenseService::Unlicensed);
    let owner = test_user(false);
    let model = test_model(&owner, "articles-ndb", ModelType::Ndb);

    let config = serde_json::json!({ "task": "train" });
    fixture
        .launcher
        .launch_train_job(&model, &config, &JobOptionsRequest::default())
        .await
        .unwrap();

    let job = fixture
        .orchestrator
        .job(&format!("train-{}", model.id))
        .expect("job was not started");
    assert!(matches!(job.driver, JobDriver::Docker { ref image } if image.ends_with(":v1")));
    assert_eq!(
        job.env.get("MODEL_BAZAAR_ENDPOINT").map(String::as_str),
        Some("http://bazaar.internal:8080")
    );

    let config_path = job.env.get("CONFIG_PATH").expect("no config path in env");
    assert!(fixture.storage.exists(config_path).await.unwrap());

    // the embedded token must authorize callbacks for exactly this model
    let token = job.env.get("JOB_TOKEN").expect("no job token in env");
    let claims = fixture.tokens.verify_job(token).unwrap();
    assert_eq!(claims.model_id(), model.id);
}

#[test]
async fn license_ceiling_refuses_additional_load() {
    let license = LicenseService::Verified {
        claims: LicenseClaims {
            bolt_license_key: "key".to_string(),
            cpu_mhz_limit: 5000,
            exp: Utc::now().timestamp() + 3600,
        },
    };
    let fixture = fixture(docker_driver(), license);
    let owner = test_user(false);

    let first = test_model(&owner, "first", ModelType::Ndb);
    fixture
        .launcher
        .launch_train_job(&first, &serde_json::json!({}), &JobOptionsRequest::default())
        .await
        .unwrap();

    // the second job would push requested CPU over the licensed ceiling
    let second = test_model(&owner, "second", ModelType::Ndb);
    let result = fixture
        .launcher
        .launch_train_job(&second, &serde_json::json!({}), &JobOptionsRequest::default())
        .await;
    assert!(result.is_err());
    assert!(fixture
        .orchestrator
        .job(&format!("train-{}", second.id))
        .is_none());
}

#[test]
async fn local_driver_replaces_stale_jobs() {
    let driver = DriverConfig::default();
    assert!(driver.is_local());
    let fixture = fixture(driver, LicenseService::Unlicensed);
    let owner = test_user(false);
    let model = test_model(&owner, "local-train", ModelType::NlpText);

    fixture
        .launcher
        .launch_train_job(&model, &serde_json::json!({}), &JobOptionsRequest::default())
        .await
        .unwrap();
    let name = format!("train-{}", model.id);
    fixture.orchestrator.set_state(&name, JobState::Dead);

    // an identical descriptor would be a no-op under docker; local mode
    // stops first so the job is re-rendered and running again
    fixture
        .launcher
        .launch_train_job(&model, &serde_json::json!({}), &JobOptionsRequest::default())
        .await
        .unwrap();
    assert_eq!(
        fixture.orchestrator.info(&name).await.unwrap().state,
        JobState::Running
    );
}

#[test]
async fn deploy_launch_exposes_service_with_autoscaling() {
    let fixture = fixture(docker_driver(), LicenseService::Unlicensed);
    let owner = test_user(false);
    let model = test_model(&owner, "served", ModelType::Ndb);

    fixture
        .launcher
        .launch_deploy_job(
            &model,
            &DeploySettings {
                ingress_path: "/my-search".to_string(),
                autoscaling_enabled: true,
                min_replicas: 1,
                max_replicas: 4,
                memory_mb: Some(2048),
            },
        )
        .await
        .unwrap();

    let job = fixture
        .orchestrator
        .job(&format!("deploy-{}", model.id))
        .expect("deployment was not started");
    let service = job.service.expect("deployment must expose a service");
    assert_eq!(service.ingress_path, "/my-search");
    assert!(service.autoscaling_enabled);
    assert_eq!(service.max_replicas, 4);
    assert_eq!(job.resources.memory_mb, 2048);
}

#[test]
async fn platform_jobs_honor_skips_and_are_idempotent() {
    let fixture = fixture(docker_driver(), LicenseService::Unlicensed);
    let platform = PlatformJobs::new(
        fixture.launcher.clone(),
        fixture.storage.clone(),
        PlatformJobsConfig {
            skip_cache: true,
            ..Default::default()
        },
        "http://bazaar.internal:8080".to_string(),
        Some("postgres://grafana@db/grafana".to_string()),
    );

    platform.start_all().await.unwrap();

    assert!(fixture.orchestrator.job("llm-cache").is_none());
    assert!(fixture.orchestrator.job("llm-dispatch").is_some());
    assert!(fixture.orchestrator.job("frontend").is_some());

    let prometheus = fixture
        .storage
        .read(PROMETHEUS_CONFIG_PATH)
        .await
        .unwrap();
    assert!(std::str::from_utf8(&prometheus)
        .unwrap()
        .contains("/api/v2/telemetry/deployment-services"));

    // starting twice produces one logical job per kind
    let before = fixture.orchestrator.started_jobs().len();
    platform.start_all().await.unwrap();
    assert_eq!(fixture.orchestrator.started_jobs().len(), before);
}
