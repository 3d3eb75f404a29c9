use crate::fakes::{test_user, InMemoryModelRepo, InMemoryUploadRepo};
use bazaar_common::model::{ModelType, TrainStatus};
use bazaar_service::config::JwtConfig;
use bazaar_service::repo::model::ModelRepo;
use bazaar_service::service::token::TokenService;
use bazaar_service::service::upload::{UploadService, UploadServiceError};
use bazaar_service_base::storage::memory::InMemoryStorage;
use bazaar_service_base::storage::SharedStorage;
use std::io::Write;
use std::sync::Arc;
use test_r::test;

struct Fixture {
    owner: bazaar_service::model::User,
    model_repo: Arc<InMemoryModelRepo>,
    upload_repo: Arc<InMemoryUploadRepo>,
    storage: Arc<InMemoryStorage>,
    service: UploadService,
}

fn fixture(session_ttl: std::time::Duration) -> Fixture {
    let owner = test_user(false);
    let model_repo = Arc::new(InMemoryModelRepo::default());
    let upload_repo = Arc::new(InMemoryUploadRepo::default());
    let storage = Arc::new(InMemoryStorage::new());
    let tokens = Arc::new(TokenService::new(
        &JwtConfig::default(),
        std::time::Duration::from_secs(900),
    ));
    let service = UploadService::new(
        upload_repo.clone(),
        model_repo.clone(),
        storage.clone(),
        tokens,
        session_ttl,
    );
    Fixture {
        owner,
        model_repo,
        upload_repo,
        storage,
        service,
    }
}

fn archive_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        let options: zip::write::SimpleFileOptions = Default::default();
        for (name, content) in entries {
            writer.start_file(name.to_string(), options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }
    buffer.into_inner()
}

#[test]
async fn chunked_import_creates_a_trained_model() {
    let fixture = fixture(std::time::Duration::from_secs(3600));
    let (upload_id, _token) = fixture
        .service
        .start_model_upload(&fixture.owner, "imported-ndb")
        .await
        .unwrap();

    let archive = archive_with(&[
        ("model.json", br#"{"model_type": "ndb"}"#.as_slice()),
        ("weights/model.bin", b"weights".as_slice()),
    ]);

    // out-of-order chunk uploads must still assemble in index order
    let half = archive.len() / 2;
    fixture
        .service
        .put_chunk(&upload_id, 1, &archive[half..])
        .await
        .unwrap();
    fixture
        .service
        .put_chunk(&upload_id, 0, &archive[..half])
        .await
        .unwrap();

    let model = fixture.service.commit(&upload_id).await.unwrap();
    assert_eq!(model.name, "imported-ndb");
    assert_eq!(model.model_type, ModelType::Ndb);
    assert_eq!(model.train_status, TrainStatus::Complete);
    assert_eq!(model.user_id, fixture.owner.id);

    // artifacts are in place under the model prefix
    let weights = fixture
        .storage
        .read(&format!("models/{}/weights/model.bin", model.id))
        .await
        .unwrap();
    assert_eq!(&weights[..], b"weights");

    // the session and its scratch space are gone
    assert!(fixture.upload_repo.sessions.lock().is_empty());
    assert!(!fixture
        .storage
        .exists(&format!("uploads/{upload_id}"))
        .await
        .unwrap());

    // the model row exists
    assert!(fixture
        .model_repo
        .get(&model.id)
        .await
        .unwrap()
        .is_some());
}

#[test]
async fn commit_without_descriptor_is_unsupported() {
    let fixture = fixture(std::time::Duration::from_secs(3600));
    let (upload_id, _token) = fixture
        .service
        .start_model_upload(&fixture.owner, "mystery")
        .await
        .unwrap();

    let archive = archive_with(&[("weights.bin", b"???".as_slice())]);
    fixture
        .service
        .put_chunk(&upload_id, 0, &archive)
        .await
        .unwrap();

    let result = fixture.service.commit(&upload_id).await;
    let error = result.unwrap_err();
    assert!(matches!(error, UploadServiceError::UnsupportedFiletype));
    // clients match this wording
    assert!(error.to_string().contains("Unsupported filetype"));
}

#[test]
async fn commit_without_chunks_is_refused() {
    let fixture = fixture(std::time::Duration::from_secs(3600));
    let (upload_id, _token) = fixture
        .service
        .start_model_upload(&fixture.owner, "empty")
        .await
        .unwrap();
    assert!(matches!(
        fixture.service.commit(&upload_id).await,
        Err(UploadServiceError::NoChunks)
    ));
}

#[test]
async fn janitor_reaps_abandoned_sessions() {
    let fixture = fixture(std::time::Duration::from_secs(0));
    let (upload_id, _token) = fixture
        .service
        .start_model_upload(&fixture.owner, "abandoned")
        .await
        .unwrap();
    fixture
        .service
        .put_chunk(&upload_id, 0, b"partial")
        .await
        .unwrap();

    let reaped = fixture.service.reap_expired().await.unwrap();
    assert_eq!(reaped, 1);
    assert!(fixture.upload_repo.sessions.lock().is_empty());
    assert!(!fixture
        .storage
        .exists(&format!("uploads/{upload_id}"))
        .await
        .unwrap());
}

#[test]
async fn train_data_uploads_land_under_the_data_prefix() {
    let fixture = fixture(std::time::Duration::from_secs(3600));
    let upload_id = fixture
        .service
        .upload_train_data(
            &fixture.owner,
            vec![
                ("articles.csv".to_string(), b"id,text".to_vec()),
                ("../sneaky.csv".to_string(), b"x".to_vec()),
            ],
        )
        .await
        .unwrap();

    let entries = fixture
        .storage
        .list(&format!("data/{upload_id}"))
        .await
        .unwrap();
    // path separators in client filenames are neutralized
    assert_eq!(entries, vec![".._sneaky.csv", "articles.csv"]);
}
