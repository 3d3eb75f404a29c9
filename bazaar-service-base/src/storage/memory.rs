use super::{
    strip_zip_extension, validate_relative_path, ByteStream, SharedStorage, StorageError,
    StorageUsage,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;

/// Map-backed storage for tests and single-process bring-up; no directory
/// entries exist, directories are implied by key prefixes.
#[derive(Default)]
pub struct InMemoryStorage {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalized(path: &str) -> String {
        path.trim_matches('/').to_string()
    }
}

#[async_trait]
impl SharedStorage for InMemoryStorage {
    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        validate_relative_path(path)?;
        let key = Self::normalized(path);
        self.files
            .lock()
            .get(&key)
            .map(|data| Bytes::from(data.clone()))
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, StorageError> {
        let data = self.read(path).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        validate_relative_path(path)?;
        self.files
            .lock()
            .insert(Self::normalized(path), data.to_vec());
        Ok(())
    }

    async fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        validate_relative_path(path)?;
        self.files
            .lock()
            .entry(Self::normalized(path))
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_relative_path(path)?;
        let key = Self::normalized(path);
        let prefix = format!("{key}/");
        self.files
            .lock()
            .retain(|k, _| k != &key && !k.starts_with(&prefix));
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
        validate_relative_path(path)?;
        let key = Self::normalized(path);
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };
        let files = self.files.lock();
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| match rest.split_once('/') {
                Some((first, _)) => first.to_string(),
                None => rest.to_string(),
            })
            .collect();
        names.sort();
        names.dedup();
        if names.is_empty() && !files.contains_key(&key) {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(names)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        validate_relative_path(path)?;
        let key = Self::normalized(path);
        let prefix = format!("{key}/");
        let files = self.files.lock();
        Ok(files.contains_key(&key) || files.keys().any(|k| k.starts_with(&prefix)))
    }

    async fn size(&self, path: &str) -> Result<u64, StorageError> {
        validate_relative_path(path)?;
        let key = Self::normalized(path);
        let prefix = format!("{key}/");
        let files = self.files.lock();
        if let Some(data) = files.get(&key) {
            return Ok(data.len() as u64);
        }
        let total: u64 = files
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.len() as u64)
            .sum();
        if total == 0 && !files.keys().any(|k| k.starts_with(&prefix)) {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(total)
    }

    async fn usage(&self) -> Result<StorageUsage, StorageError> {
        let used: u64 = self.files.lock().values().map(|v| v.len() as u64).sum();
        let total = 1 << 30;
        Ok(StorageUsage {
            total_bytes: total,
            free_bytes: total.saturating_sub(used),
        })
    }

    async fn zip(&self, path: &str) -> Result<String, StorageError> {
        validate_relative_path(path)?;
        let key = Self::normalized(path);
        let prefix = format!("{key}/");
        let archive_rel = format!("{path}.zip");

        let entries: Vec<(String, Vec<u8>)> = {
            let files = self.files.lock();
            files
                .iter()
                .filter_map(|(k, v)| {
                    k.strip_prefix(&prefix)
                        .map(|rel| (rel.to_string(), v.clone()))
                })
                .collect()
        };
        if entries.is_empty() {
            return Err(StorageError::NotFound(path.to_string()));
        }

        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            let options =
                SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
            for (rel, data) in entries {
                writer
                    .start_file(rel, options)
                    .map_err(|e| StorageError::Io(format!("{path}: {e}")))?;
                writer
                    .write_all(&data)
                    .map_err(|e| StorageError::Io(format!("{path}: {e}")))?;
            }
            writer
                .finish()
                .map_err(|e| StorageError::Io(format!("{path}: {e}")))?;
        }
        self.files
            .lock()
            .insert(Self::normalized(&archive_rel), buffer.into_inner());
        Ok(archive_rel)
    }

    async fn unzip(&self, zip_path: &str) -> Result<(), StorageError> {
        validate_relative_path(zip_path)?;
        let dest = Self::normalized(strip_zip_extension(zip_path)?);
        let data = self.read(zip_path).await?;

        let mut archive = zip::ZipArchive::new(Cursor::new(data.to_vec()))
            .map_err(|e| StorageError::Io(format!("{zip_path}: {e}")))?;
        let mut extracted = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| StorageError::Io(format!("{zip_path}: {e}")))?;
            if entry.is_dir() {
                continue;
            }
            let Some(rel) = entry.enclosed_name() else {
                continue;
            };
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| StorageError::Io(format!("{zip_path}: {e}")))?;
            extracted.push((format!("{dest}/{}", rel.to_string_lossy()), content));
        }
        let mut files = self.files.lock();
        for (key, content) in extracted {
            files.insert(key, content);
        }
        Ok(())
    }

    fn location(&self) -> String {
        "memory://".to_string()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn zip_unzip_round_trip() {
        let storage = InMemoryStorage::new();
        storage.write("models/m/a.txt", b"alpha").await.unwrap();
        storage.write("models/m/sub/b.txt", b"beta").await.unwrap();

        let archive = storage.zip("models/m").await.unwrap();
        storage.delete("models/m").await.unwrap();
        storage.unzip(&archive).await.unwrap();

        assert_eq!(&storage.read("models/m/a.txt").await.unwrap()[..], b"alpha");
        assert_eq!(
            &storage.read("models/m/sub/b.txt").await.unwrap()[..],
            b"beta"
        );
    }

    #[test]
    async fn list_collapses_subdirectories() {
        let storage = InMemoryStorage::new();
        storage.write("data/u/one", b"1").await.unwrap();
        storage.write("data/u/sub/two", b"2").await.unwrap();
        assert_eq!(storage.list("data/u").await.unwrap(), vec!["one", "sub"]);
    }

    #[test]
    async fn delete_removes_subtree_only() {
        let storage = InMemoryStorage::new();
        storage.write("models/m1/a", b"1").await.unwrap();
        storage.write("models/m10/b", b"2").await.unwrap();
        storage.delete("models/m1").await.unwrap();
        assert!(!storage.exists("models/m1").await.unwrap());
        assert!(storage.exists("models/m10").await.unwrap());
    }
}
