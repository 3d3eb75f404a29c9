use crate::fakes::{test_model, test_user, InMemoryApiKeyRepo, InMemoryModelRepo, InMemoryTeamRepo, InMemoryUserRepo};
use bazaar_common::model::{ModelPermission, ModelType};
use bazaar_service::repo::model::ModelRepo;
use bazaar_service::service::api_key::{ApiKeyError, ApiKeyService};
use bazaar_service::service::permission::PermissionService;
use chrono::{Duration, Utc};
use std::sync::Arc;
use test_r::test;

struct Fixture {
    owner: bazaar_service::model::User,
    model_repo: Arc<InMemoryModelRepo>,
    api_key_repo: Arc<InMemoryApiKeyRepo>,
    service: ApiKeyService,
}

async fn fixture() -> Fixture {
    let owner = test_user(false);
    let model_repo = Arc::new(InMemoryModelRepo::default());
    let team_repo = Arc::new(InMemoryTeamRepo::default());
    let user_repo = Arc::new(InMemoryUserRepo::with_users([owner.clone()]));
    let api_key_repo = Arc::new(InMemoryApiKeyRepo::default());
    let permissions = Arc::new(PermissionService::new(
        model_repo.clone(),
        team_repo.clone(),
    ));
    let service = ApiKeyService::new(api_key_repo.clone(), user_repo, permissions);
    Fixture {
        owner,
        model_repo,
        api_key_repo,
        service,
    }
}

#[test]
async fn scoped_key_authorizes_only_its_models() {
    let fixture = fixture().await;
    let ndb = test_model(&fixture.owner, "ndb", ModelType::Ndb);
    let nlp = test_model(&fixture.owner, "nlp", ModelType::NlpText);
    fixture.model_repo.create(&ndb).await.unwrap();
    fixture.model_repo.create(&nlp).await.unwrap();

    let raw_key = fixture
        .service
        .create(
            &fixture.owner,
            "deploy-ndb",
            &[ndb.id],
            false,
            Utc::now() + Duration::days(30),
        )
        .await
        .unwrap();
    assert!(raw_key.starts_with("mbk-"));

    // in scope: resolves to the owner with owner-level permission
    let principal = fixture
        .service
        .authorize(&raw_key, &ndb.id, ModelPermission::Owner)
        .await
        .unwrap();
    assert_eq!(principal.id, fixture.owner.id);

    // out of scope: refused even though the owner could access the model
    let result = fixture
        .service
        .authorize(&raw_key, &nlp.id, ModelPermission::Owner)
        .await;
    assert!(matches!(result, Err(ApiKeyError::NotAllowed(id)) if id == nlp.id));
}

#[test]
async fn all_models_key_covers_everything_the_owner_can_touch() {
    let fixture = fixture().await;
    let ndb = test_model(&fixture.owner, "ndb", ModelType::Ndb);
    fixture.model_repo.create(&ndb).await.unwrap();

    let raw_key = fixture
        .service
        .create(
            &fixture.owner,
            "everything",
            &[],
            true,
            Utc::now() + Duration::days(1),
        )
        .await
        .unwrap();

    fixture
        .service
        .authorize(&raw_key, &ndb.id, ModelPermission::Owner)
        .await
        .unwrap();
}

#[test]
async fn expired_keys_are_revoked_on_sight() {
    let fixture = fixture().await;
    let ndb = test_model(&fixture.owner, "ndb", ModelType::Ndb);
    fixture.model_repo.create(&ndb).await.unwrap();

    let raw_key = fixture
        .service
        .create(
            &fixture.owner,
            "stale",
            &[ndb.id],
            false,
            Utc::now() - Duration::minutes(1),
        )
        .await
        .unwrap();

    let result = fixture
        .service
        .authorize(&raw_key, &ndb.id, ModelPermission::Read)
        .await;
    assert!(matches!(result, Err(ApiKeyError::Expired)));

    // the key row is gone, so a retry cannot even find it
    let result = fixture
        .service
        .authorize(&raw_key, &ndb.id, ModelPermission::Read)
        .await;
    assert!(matches!(result, Err(ApiKeyError::Invalid)));
    assert!(fixture.api_key_repo.keys.lock().is_empty());
}

#[test]
async fn tampered_secrets_fail_verification() {
    let fixture = fixture().await;
    let ndb = test_model(&fixture.owner, "ndb", ModelType::Ndb);
    fixture.model_repo.create(&ndb).await.unwrap();

    let raw_key = fixture
        .service
        .create(
            &fixture.owner,
            "real",
            &[ndb.id],
            false,
            Utc::now() + Duration::days(1),
        )
        .await
        .unwrap();

    let (prefix, _secret) = raw_key.split_at(raw_key.find('.').unwrap() + 1);
    let forged = format!("{prefix}{}", "A".repeat(40));
    let result = fixture
        .service
        .authorize(&forged, &ndb.id, ModelPermission::Read)
        .await;
    assert!(matches!(result, Err(ApiKeyError::Invalid)));
}

#[test]
async fn listing_is_owner_only() {
    let fixture = fixture().await;
    let ndb = test_model(&fixture.owner, "ndb", ModelType::Ndb);
    fixture.model_repo.create(&ndb).await.unwrap();
    fixture
        .service
        .create(
            &fixture.owner,
            "mine",
            &[ndb.id],
            false,
            Utc::now() + Duration::days(1),
        )
        .await
        .unwrap();

    let listed = fixture.service.list(&fixture.owner.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0.name, "mine");
    assert_eq!(listed[0].1, vec![ndb.id]);

    let stranger = test_user(false);
    assert!(fixture.service.list(&stranger.id).await.unwrap().is_empty());
}
