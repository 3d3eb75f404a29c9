use crate::model::{Model, UploadSession, User};
use crate::repo::model::ModelRepo;
use crate::repo::upload::UploadRepo;
use crate::repo::RepoError;
use crate::service::job::{data_prefix, model_prefix, upload_chunk_prefix};
use crate::service::token::TokenService;
use bazaar_common::model::{
    DefaultPermission, DeployStatus, ModelAccess, ModelId, ModelType, TrainStatus, UploadId,
};
use bazaar_common::SafeDisplay;
use bazaar_service_base::storage::{SharedStorage, StorageError};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum UploadServiceError {
    #[error("upload session not found")]
    SessionNotFound,
    #[error("this session is not a model upload")]
    NotAModelUpload,
    #[error("no chunks were uploaded")]
    NoChunks,
    #[error("Unsupported filetype")]
    UnsupportedFiletype,
    #[error("model with this name already exists")]
    NameTaken,
    #[error("token error: {0}")]
    Token(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for UploadServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            UploadServiceError::Storage(inner) => inner.to_safe_string(),
            UploadServiceError::InternalRepoError(inner) => inner.to_safe_string(),
            UploadServiceError::Token(_) => "internal token error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Training-data uploads and chunked model imports, plus the janitor that
/// reaps abandoned sessions.
pub struct UploadService {
    upload_repo: Arc<dyn UploadRepo>,
    model_repo: Arc<dyn ModelRepo>,
    storage: Arc<dyn SharedStorage>,
    tokens: Arc<TokenService>,
    session_ttl: std::time::Duration,
}

impl UploadService {
    pub fn new(
        upload_repo: Arc<dyn UploadRepo>,
        model_repo: Arc<dyn ModelRepo>,
        storage: Arc<dyn SharedStorage>,
        tokens: Arc<TokenService>,
        session_ttl: std::time::Duration,
    ) -> Self {
        Self {
            upload_repo,
            model_repo,
            storage,
            tokens,
            session_ttl,
        }
    }

    /// Stores training input files; later train requests reference the
    /// returned id with `{location: "upload"}`.
    pub async fn upload_train_data(
        &self,
        user: &User,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<UploadId, UploadServiceError> {
        let session = UploadSession {
            id: UploadId::new_v4(),
            user_id: user.id,
            model_name: None,
            created_at: Utc::now(),
        };
        self.upload_repo.create(&session).await?;
        for (filename, content) in files {
            let safe_name = filename.replace(['/', '\\'], "_");
            self.storage
                .write(&format!("{}/{safe_name}", data_prefix(&session.id)), &content)
                .await?;
        }
        info!(upload_id = %session.id, "stored training data upload");
        Ok(session.id)
    }

    /// Opens a chunked import session; the returned token scopes all chunk
    /// and commit calls to this session.
    pub async fn start_model_upload(
        &self,
        user: &User,
        model_name: &str,
    ) -> Result<(UploadId, String), UploadServiceError> {
        let session = UploadSession {
            id: UploadId::new_v4(),
            user_id: user.id,
            model_name: Some(model_name.to_string()),
            created_at: Utc::now(),
        };
        self.upload_repo.create(&session).await?;
        let ttl = Duration::from_std(self.session_ttl).unwrap_or_else(|_| Duration::hours(24));
        let token = self
            .tokens
            .issue_upload(session.id, ttl)
            .map_err(|e| UploadServiceError::Token(e.to_string()))?;
        Ok((session.id, token))
    }

    pub async fn put_chunk(
        &self,
        upload_id: &UploadId,
        chunk_idx: u32,
        content: &[u8],
    ) -> Result<(), UploadServiceError> {
        let session = self
            .upload_repo
            .get(upload_id)
            .await?
            .ok_or(UploadServiceError::SessionNotFound)?;
        if session.model_name.is_none() {
            return Err(UploadServiceError::NotAModelUpload);
        }
        self.storage
            .write(
                &format!("{}/chunk-{chunk_idx}", upload_chunk_prefix(upload_id)),
                content,
            )
            .await?;
        Ok(())
    }

    /// Stitches the chunks in ascending index order, expands the archive
    /// under the new model's prefix and derives the model type from the
    /// descriptor it carries.
    pub async fn commit(&self, upload_id: &UploadId) -> Result<Model, UploadServiceError> {
        let session = self
            .upload_repo
            .get(upload_id)
            .await?
            .ok_or(UploadServiceError::SessionNotFound)?;
        let Some(model_name) = session.model_name.clone() else {
            return Err(UploadServiceError::NotAModelUpload);
        };

        let prefix = upload_chunk_prefix(upload_id);
        let names = match self.storage.list(&prefix).await {
            Ok(names) => names,
            Err(StorageError::NotFound(_)) => return Err(UploadServiceError::NoChunks),
            Err(other) => return Err(other.into()),
        };
        let mut chunks: Vec<u32> = names
            .iter()
            .filter_map(|name| name.strip_prefix("chunk-"))
            .filter_map(|idx| idx.parse::<u32>().ok())
            .collect();
        if chunks.is_empty() {
            return Err(UploadServiceError::NoChunks);
        }
        chunks.sort_unstable();

        let mut assembled = Vec::new();
        for idx in chunks {
            let chunk = self.storage.read(&format!("{prefix}/chunk-{idx}")).await?;
            assembled.extend_from_slice(&chunk);
        }

        let model_id = ModelId::new_v4();
        let archive = format!("{}.zip", model_prefix(&model_id));
        self.storage.write(&archive, &assembled).await?;
        if self.storage.unzip(&archive).await.is_err() {
            self.storage.delete(&archive).await?;
            return Err(UploadServiceError::UnsupportedFiletype);
        }
        self.storage.delete(&archive).await?;

        let descriptor = self
            .storage
            .read(&format!("{}/model.json", model_prefix(&model_id)))
            .await
            .ok();
        let Some(model_type) = descriptor.as_deref().and_then(parse_descriptor) else {
            self.storage.delete(&model_prefix(&model_id)).await?;
            return Err(UploadServiceError::UnsupportedFiletype);
        };

        let model = Model {
            id: model_id,
            name: model_name,
            model_type,
            published_date: Utc::now(),
            train_status: TrainStatus::Complete,
            deploy_status: DeployStatus::NotStarted,
            access: ModelAccess::Private,
            default_permission: DefaultPermission::Read,
            deployment_name: None,
            base_model_id: None,
            user_id: session.user_id,
            team_id: None,
        };
        match self.model_repo.create(&model).await {
            Ok(()) => {}
            Err(RepoError::UniqueViolation(_)) => {
                self.storage.delete(&model_prefix(&model_id)).await?;
                return Err(UploadServiceError::NameTaken);
            }
            Err(other) => return Err(other.into()),
        }

        self.storage.delete(&prefix).await?;
        self.upload_repo.delete(upload_id).await?;
        info!(upload_id = %upload_id, model_id = %model.id, "imported uploaded model");
        Ok(model)
    }

    /// Removes sessions (and their scratch space) older than the TTL.
    pub async fn reap_expired(&self) -> Result<usize, UploadServiceError> {
        let ttl = Duration::from_std(self.session_ttl).unwrap_or_else(|_| Duration::hours(24));
        let cutoff = Utc::now() - ttl;
        let expired = self.upload_repo.created_before(cutoff).await?;
        let count = expired.len();
        for session in expired {
            warn!(upload_id = %session.id, "reaping abandoned upload session");
            self.storage.delete(&data_prefix(&session.id)).await?;
            self.storage.delete(&upload_chunk_prefix(&session.id)).await?;
            self.upload_repo.delete(&session.id).await?;
        }
        Ok(count)
    }
}

/// Reads `{"model_type": "..."}` from the descriptor an imported archive
/// must carry at its root.
pub fn parse_descriptor(bytes: &[u8]) -> Option<ModelType> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value
        .get("model_type")
        .and_then(|t| t.as_str())
        .and_then(|t| t.parse::<ModelType>().ok())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn descriptor_parsing() {
        assert_eq!(
            parse_descriptor(br#"{"model_type": "ndb"}"#),
            Some(ModelType::Ndb)
        );
        assert_eq!(
            parse_descriptor(br#"{"model_type": "nlp-token", "version": 3}"#),
            Some(ModelType::NlpToken)
        );
        assert_eq!(parse_descriptor(br#"{"model_type": "word2vec"}"#), None);
        assert_eq!(parse_descriptor(br#"{"other": true}"#), None);
        assert_eq!(parse_descriptor(b"not json"), None);
    }
}
