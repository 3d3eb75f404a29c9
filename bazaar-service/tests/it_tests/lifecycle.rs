use crate::fakes::{test_model, test_user, InMemoryModelRepo, InMemoryTeamRepo, InMemoryUploadRepo, InMemoryUserRepo};
use bazaar_common::model::{DeployStatus, JobLogLevel, ModelType, TrainStatus};
use bazaar_service::config::{DriverConfig, JwtConfig, ReconcilerConfig};
use bazaar_service::model::{DeployRequest, TrainRequest, User};
use bazaar_service::repo::model::ModelRepo;
use bazaar_service::service::deploy::{DeployService, DeployServiceError};
use bazaar_service::service::job::JobLauncher;
use bazaar_service::service::license::LicenseService;
use bazaar_service::service::model::{ModelService, ModelServiceError};
use bazaar_service::service::permission::PermissionService;
use bazaar_service::service::reconciler::Reconciler;
use bazaar_service::service::token::TokenService;
use bazaar_service::service::train::{TrainService, TrainServiceError};
use bazaar_service::service::workflow::{WorkflowService, WorkflowServiceError};
use bazaar_service_base::orchestrator::memory::InMemoryOrchestrator;
use bazaar_service_base::orchestrator::{JobState, Orchestrator};
use bazaar_service_base::storage::memory::InMemoryStorage;
use bazaar_service_base::storage::SharedStorage;
use std::sync::Arc;
use test_r::test;

struct World {
    owner: User,
    model_repo: Arc<InMemoryModelRepo>,
    orchestrator: Arc<InMemoryOrchestrator>,
    storage: Arc<InMemoryStorage>,
    permissions: Arc<PermissionService>,
    launcher: Arc<JobLauncher>,
}

fn world() -> World {
    let owner = test_user(false);
    let model_repo = Arc::new(InMemoryModelRepo::default());
    let team_repo = Arc::new(InMemoryTeamRepo::default());
    let orchestrator = Arc::new(InMemoryOrchestrator::new("bazaar.example.com"));
    let storage = Arc::new(InMemoryStorage::new());
    let permissions = Arc::new(PermissionService::new(
        model_repo.clone(),
        team_repo.clone(),
    ));
    let tokens = Arc::new(TokenService::new(
        &JwtConfig::default(),
        std::time::Duration::from_secs(900),
    ));
    let launcher = Arc::new(JobLauncher::new(
        orchestrator.clone(),
        storage.clone(),
        Arc::new(LicenseService::Unlicensed),
        tokens,
        DriverConfig {
            mode: "docker".to_string(),
            tag: Some("v1".to_string()),
            ..DriverConfig::default()
        },
        "http://bazaar.internal:8080".to_string(),
    ));
    World {
        owner,
        model_repo,
        orchestrator,
        storage,
        permissions,
        launcher,
    }
}

impl World {
    fn deploy_service(&self) -> DeployService {
        DeployService::new(
            self.model_repo.clone(),
            self.permissions.clone(),
            self.launcher.clone(),
            self.storage.clone(),
        )
    }

    fn workflow_service(&self) -> WorkflowService {
        WorkflowService::new(self.model_repo.clone(), self.permissions.clone())
    }

    fn model_service(&self) -> ModelService {
        let user_repo = Arc::new(InMemoryUserRepo::with_users([self.owner.clone()]));
        ModelService::new(
            self.model_repo.clone(),
            user_repo,
            self.permissions.clone(),
            self.storage.clone(),
            self.launcher.clone(),
        )
    }

    fn train_service(&self) -> TrainService {
        TrainService::new(
            self.model_repo.clone(),
            Arc::new(InMemoryUploadRepo::default()),
            self.permissions.clone(),
            self.launcher.clone(),
            self.storage.clone(),
        )
    }

    async fn insert(&self, mut model: bazaar_service::model::Model) -> bazaar_service::model::Model {
        model.user_id = self.owner.id;
        self.model_repo.create(&model).await.unwrap();
        model
    }
}

fn trained(owner: &User, name: &str, model_type: ModelType) -> bazaar_service::model::Model {
    let mut model = test_model(owner, name, model_type);
    model.train_status = TrainStatus::Complete;
    model
}

#[test]
async fn deploy_refuses_untrained_models() {
    let world = world();
    let mut model = test_model(&world.owner, "half-trained", ModelType::Ndb);
    model.train_status = TrainStatus::InProgress;
    let model = world.insert(model).await;

    let result = world
        .deploy_service()
        .deploy(&world.owner, &model.id, &DeployRequest::default())
        .await;
    assert!(matches!(result, Err(DeployServiceError::NotTrained)));
    assert!(world
        .orchestrator
        .job(&format!("deploy-{}", model.id))
        .is_none());
}

#[test]
async fn workflow_deploy_launches_components_first() {
    let world = world();
    let ndb = world
        .insert(trained(&world.owner, "retriever", ModelType::Ndb))
        .await;
    let guardrail = world
        .insert(trained(&world.owner, "pii-guard", ModelType::NlpToken))
        .await;

    let workflow = world
        .workflow_service()
        .create_enterprise_search(&world.owner, "search", &ndb.id, Some(&guardrail.id))
        .await
        .unwrap();
    assert_eq!(workflow.train_status, TrainStatus::Complete);

    let endpoint = world
        .deploy_service()
        .deploy(
            &world.owner,
            &workflow.id,
            &DeployRequest {
                deployment_name: Some("search-prod".to_string()),
                ..DeployRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(endpoint, "https://bazaar.example.com/search-prod");

    for id in [&ndb.id, &guardrail.id, &workflow.id] {
        assert!(
            world.orchestrator.job(&format!("deploy-{id}")).is_some(),
            "missing deployment for {id}"
        );
        let model = world.model_repo.get(id).await.unwrap().unwrap();
        assert_eq!(model.deploy_status, DeployStatus::Starting);
    }
}

#[test]
async fn undeploy_stops_job_and_settles_status() {
    let world = world();
    let model = world
        .insert(trained(&world.owner, "served", ModelType::Ndb))
        .await;
    let deploy_service = world.deploy_service();

    deploy_service
        .deploy(&world.owner, &model.id, &DeployRequest::default())
        .await
        .unwrap();
    let job_name = format!("deploy-{}", model.id);
    assert!(world.orchestrator.job(&job_name).is_some());

    deploy_service.undeploy(&world.owner, &model.id).await.unwrap();
    assert!(world.orchestrator.job(&job_name).is_none());
    let model = world.model_repo.get(&model.id).await.unwrap().unwrap();
    assert_eq!(model.deploy_status, DeployStatus::Stopped);

    // a stopped deployment can be rolled out again
    deploy_service
        .deploy(&world.owner, &model.id, &DeployRequest::default())
        .await
        .unwrap();
    assert!(world.orchestrator.job(&job_name).is_some());
}

#[test]
async fn duplicate_deployment_names_conflict() {
    let world = world();
    let first = world
        .insert(trained(&world.owner, "first", ModelType::Ndb))
        .await;
    let second = world
        .insert(trained(&world.owner, "second", ModelType::Ndb))
        .await;
    let deploy_service = world.deploy_service();

    let request = DeployRequest {
        deployment_name: Some("prod".to_string()),
        ..DeployRequest::default()
    };
    deploy_service
        .deploy(&world.owner, &first.id, &request)
        .await
        .unwrap();
    let result = deploy_service
        .deploy(&world.owner, &second.id, &request)
        .await;
    assert!(matches!(
        result,
        Err(DeployServiceError::DeploymentNameTaken)
    ));
}

#[test]
async fn deletion_is_refused_while_dependents_exist() {
    let world = world();
    let ndb = world
        .insert(trained(&world.owner, "retriever", ModelType::Ndb))
        .await;
    let workflow = world
        .workflow_service()
        .create_enterprise_search(&world.owner, "search", &ndb.id, None)
        .await
        .unwrap();

    world
        .storage
        .write(&format!("models/{}/model.bin", ndb.id), b"weights")
        .await
        .unwrap();

    let model_service = world.model_service();
    let result = model_service.delete(&world.owner, &ndb.id).await;
    assert!(matches!(result, Err(ModelServiceError::HasDependents)));
    assert!(world.storage.exists(&format!("models/{}", ndb.id)).await.unwrap());

    model_service.delete(&world.owner, &workflow.id).await.unwrap();
    model_service.delete(&world.owner, &ndb.id).await.unwrap();
    assert!(world.model_repo.get(&ndb.id).await.unwrap().is_none());
    // artifacts are gone with the row
    assert!(!world.storage.exists(&format!("models/{}", ndb.id)).await.unwrap());
}

#[test]
async fn workflow_components_must_match_types() {
    let world = world();
    let not_ndb = world
        .insert(trained(&world.owner, "classifier", ModelType::NlpText))
        .await;
    let result = world
        .workflow_service()
        .create_enterprise_search(&world.owner, "search", &not_ndb.id, None)
        .await;
    assert!(matches!(
        result,
        Err(WorkflowServiceError::ComponentTypeMismatch { .. })
    ));
}

#[test]
async fn train_start_creates_starting_model_and_job() {
    let world = world();
    let train_service = world.train_service();

    world.storage.write("data/shared/articles.csv", b"a,b").await.unwrap();
    let request = TrainRequest {
        model_name: "articles".to_string(),
        data: Some(bazaar_service::model::DataSource {
            location: "share".to_string(),
            path: "data/shared/articles.csv".to_string(),
        }),
        base_model_id: None,
        job_options: Default::default(),
        model_options: None,
    };

    let model = train_service
        .start(&world.owner, ModelType::Ndb, "train", &request, false)
        .await
        .unwrap();
    assert_eq!(model.train_status, TrainStatus::Starting);
    assert!(world
        .orchestrator
        .job(&format!("train-{}", model.id))
        .is_some());

    // same owner, same name: conflict
    let result = train_service
        .start(&world.owner, ModelType::Ndb, "train", &request, false)
        .await;
    assert!(matches!(result, Err(TrainServiceError::NameTaken)));
}

#[test]
async fn train_callbacks_walk_the_state_machine() {
    let world = world();
    let train_service = world.train_service();
    let mut model = test_model(&world.owner, "walking", ModelType::NlpToken);
    model.train_status = TrainStatus::Starting;
    let model = world.insert(model).await;

    train_service
        .update_status(&model.id, TrainStatus::InProgress, None)
        .await
        .unwrap();
    let attributes = std::collections::BTreeMap::from([(
        "epochs".to_string(),
        "5".to_string(),
    )]);
    train_service
        .update_status(&model.id, TrainStatus::Complete, Some(&attributes))
        .await
        .unwrap();

    let stored = world.model_repo.get(&model.id).await.unwrap().unwrap();
    assert_eq!(stored.train_status, TrainStatus::Complete);
    let stored_attributes = world.model_repo.attributes(&model.id).await.unwrap();
    assert_eq!(stored_attributes.get("epochs").map(String::as_str), Some("5"));

    // a finished training cannot be moved again
    let result = train_service
        .update_status(&model.id, TrainStatus::InProgress, None)
        .await;
    assert!(matches!(
        result,
        Err(TrainServiceError::InvalidTransition { .. })
    ));
}

#[test]
async fn reconciler_fails_vanished_training_jobs() {
    let world = world();
    let mut model = test_model(&world.owner, "vanished", ModelType::Ndb);
    model.train_status = TrainStatus::InProgress;
    let model = world.insert(model).await;

    let reconciler = Arc::new(Reconciler::new(
        world.model_repo.clone(),
        world.orchestrator.clone(),
        ReconcilerConfig {
            interval: std::time::Duration::from_millis(10),
            unknown_ticks_to_failure: 2,
        },
    ));

    // no such job exists on the orchestrator: unknown, tolerated once
    reconciler.tick().await.unwrap();
    assert_eq!(
        world.model_repo.get(&model.id).await.unwrap().unwrap().train_status,
        TrainStatus::InProgress
    );

    reconciler.tick().await.unwrap();
    let stored = world.model_repo.get(&model.id).await.unwrap().unwrap();
    assert_eq!(stored.train_status, TrainStatus::Failed);

    let logs = world.model_repo.job_logs(&model.id).await.unwrap();
    assert!(logs
        .iter()
        .any(|entry| entry.level == JobLogLevel::Warning
            && entry.message.contains("no longer running")));
}

#[test]
async fn reconciler_fails_dead_deployments() {
    let world = world();
    let mut model = trained(&world.owner, "serving", ModelType::Ndb);
    model.deploy_status = DeployStatus::Complete;
    let model = world.insert(model).await;

    let deploy_job = format!("deploy-{}", model.id);
    world
        .orchestrator
        .start(&bazaar_service_base::orchestrator::Job {
            name: deploy_job.clone(),
            driver: bazaar_service_base::orchestrator::JobDriver::Docker {
                image: "img:v1".to_string(),
            },
            env: Default::default(),
            args: vec![],
            resources: bazaar_service_base::orchestrator::JobResources {
                cpu_mhz: 1000,
                memory_mb: 512,
                memory_max_mb: 1024,
                cores: 1,
            },
            service: None,
        })
        .await
        .unwrap();
    world.orchestrator.set_state(&deploy_job, JobState::Dead);

    let reconciler = Arc::new(Reconciler::new(
        world.model_repo.clone(),
        world.orchestrator.clone(),
        ReconcilerConfig {
            interval: std::time::Duration::from_millis(10),
            unknown_ticks_to_failure: 3,
        },
    ));
    reconciler.tick().await.unwrap();

    let stored = world.model_repo.get(&model.id).await.unwrap().unwrap();
    assert_eq!(stored.deploy_status, DeployStatus::Failed);
}
