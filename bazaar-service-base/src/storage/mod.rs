pub mod fs;
pub mod memory;

use async_trait::async_trait;
use bazaar_common::SafeDisplay;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync>>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("io error: {0}")]
    Io(String),
}

impl StorageError {
    pub fn from_io(path: &str, error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(path.to_string()),
            _ => StorageError::Io(format!("{path}: {error}")),
        }
    }
}

impl SafeDisplay for StorageError {
    fn to_safe_string(&self) -> String {
        match self {
            StorageError::NotFound(path) => format!("not found: {path}"),
            StorageError::PermissionDenied(path) => format!("permission denied: {path}"),
            StorageError::Io(_) => "storage error".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// The shared namespace carrying artifacts between the control plane and
/// jobs. Paths are relative to a fixed root; writes to the same path race
/// with last-writer-wins semantics.
#[async_trait]
pub trait SharedStorage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Bytes, StorageError>;

    async fn read_stream(&self, path: &str) -> Result<ByteStream, StorageError>;

    /// Create or truncate, creating missing parent directories.
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    async fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Recursive; succeeds when the path does not exist.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Immediate entries of a directory, non-recursive.
    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    async fn size(&self, path: &str) -> Result<u64, StorageError>;

    async fn usage(&self) -> Result<StorageUsage, StorageError>;

    /// Produces `<path>.zip` mirroring the subtree at `path`; returns the
    /// relative path of the archive.
    async fn zip(&self, path: &str) -> Result<String, StorageError>;

    /// Expands `<path>.zip` into `<path>`, skipping directory entries.
    async fn unzip(&self, zip_path: &str) -> Result<(), StorageError>;

    /// Opaque root identifier handed to jobs so they mount the same
    /// namespace.
    fn location(&self) -> String;
}

/// Rejects absolute paths and parent traversal before a relative path is
/// resolved against the storage root.
pub(crate) fn validate_relative_path(path: &str) -> Result<(), StorageError> {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return Err(StorageError::PermissionDenied(path.to_string()));
    }
    for component in p.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(StorageError::PermissionDenied(path.to_string()));
        }
    }
    Ok(())
}

pub(crate) fn strip_zip_extension(zip_path: &str) -> Result<&str, StorageError> {
    zip_path
        .strip_suffix(".zip")
        .ok_or_else(|| StorageError::Io(format!("{zip_path}: not a .zip path")))
}
