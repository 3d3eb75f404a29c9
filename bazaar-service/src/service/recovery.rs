use bazaar_common::SafeDisplay;
use bazaar_service_base::storage::{SharedStorage, StorageError};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

const MODELS_PREFIX: &str = "models";
const BACKUPS_PREFIX: &str = "backups";

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("there are no model artifacts to back up")]
    NothingToBackUp,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SafeDisplay for RecoveryError {
    fn to_safe_string(&self) -> String {
        match self {
            RecoveryError::Storage(inner) => inner.to_safe_string(),
            _ => self.to_string(),
        }
    }
}

/// Snapshot-and-list of the artifact tree. Database backups are operated
/// outside the control plane; these archives cover the shared storage side.
pub struct RecoveryService {
    storage: Arc<dyn SharedStorage>,
}

impl RecoveryService {
    pub fn new(storage: Arc<dyn SharedStorage>) -> Self {
        Self { storage }
    }

    pub async fn backup(&self) -> Result<String, RecoveryError> {
        if !self.storage.exists(MODELS_PREFIX).await? {
            return Err(RecoveryError::NothingToBackUp);
        }
        let archive = self.storage.zip(MODELS_PREFIX).await?;
        let bytes = self.storage.read(&archive).await?;
        self.storage.delete(&archive).await?;

        let target = format!(
            "{BACKUPS_PREFIX}/models-{}.zip",
            Utc::now().format("%Y%m%d%H%M%S")
        );
        self.storage.write(&target, &bytes).await?;
        info!(backup = %target, "created artifact backup");
        Ok(target)
    }

    pub async fn list(&self) -> Result<Vec<String>, RecoveryError> {
        match self.storage.list(BACKUPS_PREFIX).await {
            Ok(backups) => Ok(backups),
            Err(StorageError::NotFound(_)) => Ok(vec![]),
            Err(other) => Err(other.into()),
        }
    }
}
