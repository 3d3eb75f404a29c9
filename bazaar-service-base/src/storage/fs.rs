use super::{
    strip_zip_extension, validate_relative_path, ByteStream, SharedStorage, StorageError,
    StorageUsage,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// Storage over a directory on a shared filesystem (NFS or a local disk in
/// dev). The same root is bind-mounted into jobs.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root: PathBuf = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::from_io(&root.to_string_lossy(), e))?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_relative_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl SharedStorage for FsStorage {
    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .map(Bytes::from)
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, StorageError> {
        let target = self.resolve(path)?;
        let file = tokio::fs::File::open(&target)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(path, e))?;
        }
        tokio::fs::write(&target, data)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(path, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        let result = match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await,
            Ok(_) => tokio::fs::remove_file(&target).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| StorageError::from_io(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let target = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&target)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(path, e))?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::metadata(&target).await.is_ok())
    }

    async fn size(&self, path: &str) -> Result<u64, StorageError> {
        let target = self.resolve(path)?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        if meta.is_file() {
            return Ok(meta.len());
        }
        let target_clone = target.clone();
        let path_owned = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut total = 0u64;
            for entry in WalkDir::new(&target_clone) {
                let entry =
                    entry.map_err(|e| StorageError::Io(format!("{path_owned}: {e}")))?;
                if entry.file_type().is_file() {
                    total += entry
                        .metadata()
                        .map_err(|e| StorageError::Io(format!("{path_owned}: {e}")))?
                        .len();
                }
            }
            Ok(total)
        })
        .await
        .map_err(|e| StorageError::Io(e.to_string()))?
    }

    async fn usage(&self) -> Result<StorageUsage, StorageError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let disks = sysinfo::Disks::new_with_refreshed_list();
            // the disk with the longest mount point that is a prefix of root
            let disk = disks
                .list()
                .iter()
                .filter(|d| root.starts_with(d.mount_point()))
                .max_by_key(|d| d.mount_point().as_os_str().len())
                .ok_or_else(|| {
                    StorageError::Io(format!("no disk found for {}", root.display()))
                })?;
            Ok(StorageUsage {
                total_bytes: disk.total_space(),
                free_bytes: disk.available_space(),
            })
        })
        .await
        .map_err(|e| StorageError::Io(e.to_string()))?
    }

    async fn zip(&self, path: &str) -> Result<String, StorageError> {
        let source = self.resolve(path)?;
        let archive_rel = format!("{path}.zip");
        let archive = self.resolve(&archive_rel)?;
        let path_owned = path.to_string();
        tokio::task::spawn_blocking(move || zip_tree(&source, &archive, &path_owned))
            .await
            .map_err(|e| StorageError::Io(e.to_string()))??;
        Ok(archive_rel)
    }

    async fn unzip(&self, zip_path: &str) -> Result<(), StorageError> {
        let archive = self.resolve(zip_path)?;
        let dest = self.resolve(strip_zip_extension(zip_path)?)?;
        let path_owned = zip_path.to_string();
        tokio::task::spawn_blocking(move || unzip_tree(&archive, &dest, &path_owned))
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?
    }

    fn location(&self) -> String {
        self.root.to_string_lossy().to_string()
    }
}

fn zip_tree(source: &Path, archive: &Path, rel: &str) -> Result<(), StorageError> {
    let io_err = |e: std::io::Error| StorageError::from_io(rel, e);
    let zip_err = |e: zip::result::ZipError| StorageError::Io(format!("{rel}: {e}"));

    let file = std::fs::File::create(archive).map_err(io_err)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let meta = std::fs::metadata(source).map_err(io_err)?;
    if meta.is_file() {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| rel.to_string());
        writer.start_file(name, options).map_err(zip_err)?;
        let mut f = std::fs::File::open(source).map_err(io_err)?;
        std::io::copy(&mut f, &mut writer).map_err(io_err)?;
    } else {
        for entry in WalkDir::new(source) {
            let entry = entry.map_err(|e| StorageError::Io(format!("{rel}: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let entry_rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| StorageError::Io(format!("{rel}: {e}")))?
                .to_string_lossy()
                .replace('\\', "/");
            writer.start_file(entry_rel, options).map_err(zip_err)?;
            let mut f = std::fs::File::open(entry.path()).map_err(io_err)?;
            std::io::copy(&mut f, &mut writer).map_err(io_err)?;
        }
    }
    writer.finish().map_err(zip_err)?;
    Ok(())
}

fn unzip_tree(archive: &Path, dest: &Path, rel: &str) -> Result<(), StorageError> {
    let io_err = |e: std::io::Error| StorageError::from_io(rel, e);
    let zip_err = |e: zip::result::ZipError| StorageError::Io(format!("{rel}: {e}"));

    let file = std::fs::File::open(archive).map_err(io_err)?;
    let mut zip = zip::ZipArchive::new(file).map_err(zip_err)?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_err)?;
        if entry.is_dir() {
            continue;
        }
        let Some(entry_rel) = entry.enclosed_name() else {
            continue;
        };
        let out = dest.join(entry_rel);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut out_file = std::fs::File::create(&out).map_err(io_err)?;
        std::io::copy(&mut entry, &mut out_file).map_err(io_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    async fn storage() -> (tempfile::TempDir, FsStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path().join("share")).await.unwrap();
        (dir, storage)
    }

    #[test]
    async fn write_read_round_trip() {
        let (_dir, storage) = storage().await;
        storage
            .write("models/abc/config.json", b"{\"a\":1}")
            .await
            .unwrap();
        let data = storage.read("models/abc/config.json").await.unwrap();
        assert_eq!(&data[..], b"{\"a\":1}");
    }

    #[test]
    async fn write_truncates_existing_content() {
        let (_dir, storage) = storage().await;
        storage.write("f.txt", b"first version").await.unwrap();
        storage.write("f.txt", b"second").await.unwrap();
        assert_eq!(&storage.read("f.txt").await.unwrap()[..], b"second");
    }

    #[test]
    async fn append_accumulates() {
        let (_dir, storage) = storage().await;
        storage.append("logs/a.log", b"one\n").await.unwrap();
        storage.append("logs/a.log", b"two\n").await.unwrap();
        assert_eq!(&storage.read("logs/a.log").await.unwrap()[..], b"one\ntwo\n");
    }

    #[test]
    async fn read_missing_is_not_found() {
        let (_dir, storage) = storage().await;
        assert!(matches!(
            storage.read("nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    async fn parent_traversal_is_refused() {
        let (_dir, storage) = storage().await;
        assert!(matches!(
            storage.read("../outside").await,
            Err(StorageError::PermissionDenied(_))
        ));
        assert!(matches!(
            storage.write("/etc/passwd", b"x").await,
            Err(StorageError::PermissionDenied(_))
        ));
    }

    #[test]
    async fn delete_is_recursive_and_tolerates_missing() {
        let (_dir, storage) = storage().await;
        storage.write("models/m1/a", b"a").await.unwrap();
        storage.write("models/m1/sub/b", b"b").await.unwrap();
        storage.delete("models/m1").await.unwrap();
        assert!(!storage.exists("models/m1").await.unwrap());
        storage.delete("models/m1").await.unwrap();
    }

    #[test]
    async fn list_returns_immediate_entries() {
        let (_dir, storage) = storage().await;
        storage.write("data/u1/one.csv", b"1").await.unwrap();
        storage.write("data/u1/two.csv", b"2").await.unwrap();
        storage.write("data/u1/sub/three.csv", b"3").await.unwrap();
        let entries = storage.list("data/u1").await.unwrap();
        assert_eq!(entries, vec!["one.csv", "sub", "two.csv"]);
    }

    #[test]
    async fn size_of_directory_sums_files() {
        let (_dir, storage) = storage().await;
        storage.write("models/m/x", b"1234").await.unwrap();
        storage.write("models/m/deep/y", b"56").await.unwrap();
        assert_eq!(storage.size("models/m").await.unwrap(), 6);
        assert_eq!(storage.size("models/m/x").await.unwrap(), 4);
    }

    #[test]
    async fn zip_unzip_restores_tree() {
        let (_dir, storage) = storage().await;
        storage.write("models/m1/model.bin", b"weights").await.unwrap();
        storage
            .write("models/m1/meta/info.json", b"{}")
            .await
            .unwrap();

        let archive = storage.zip("models/m1").await.unwrap();
        assert_eq!(archive, "models/m1.zip");
        assert!(storage.exists("models/m1.zip").await.unwrap());

        storage.delete("models/m1").await.unwrap();
        storage.unzip("models/m1.zip").await.unwrap();

        assert_eq!(
            &storage.read("models/m1/model.bin").await.unwrap()[..],
            b"weights"
        );
        assert_eq!(
            &storage.read("models/m1/meta/info.json").await.unwrap()[..],
            b"{}"
        );
    }
}
