use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::{validate_path, ObjectStore, StorageResult};

/// Directory-backed object store.
///
/// Layout: `<root>/<path>` where `path` segments map to subdirectories.
/// Writes go to a temp file in the destination directory and are renamed
/// into place, so a crash never leaves a truncated snapshot behind.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, path: &str) -> StorageResult<PathBuf> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.root.clone(), |acc, seg| acc.join(seg)))
    }
}

fn write_atomic(target: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent dir"))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Backend(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let target = self.object_path(path)?;
        let data = data.to_vec();
        let display = path.to_string();
        blocking(move || {
            write_atomic(&target, &data).map_err(|source| StorageError::Io {
                path: display,
                source,
            })
        })
        .await?;
        debug!(path = %path, "object written");
        Ok(())
    }

    async fn get(&self, path: &str) -> StorageResult<Vec<u8>> {
        let target = self.object_path(path)?;
        let display = path.to_string();
        blocking(move || {
            fs::read(&target).map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    StorageError::NotFound { path: display }
                } else {
                    StorageError::Io {
                        path: display,
                        source,
                    }
                }
            })
        })
        .await
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let target = self.object_path(path)?;
        let display = path.to_string();
        blocking(move || match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                path: display,
                source,
            }),
        })
        .await
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let target = self.object_path(path)?;
        Ok(target.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn blob_roundtrip() {
        let (_dir, store) = make_store();
        store.put("workspaces/a.snapshot", b"hello").await.unwrap();
        let got = store.get("workspaces/a.snapshot").await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn put_replaces_existing() {
        let (dir, store) = make_store();
        store.put("ws.snapshot", b"v1").await.unwrap();
        store.put("ws.snapshot", b"v2").await.unwrap();
        assert_eq!(store.get("ws.snapshot").await.unwrap(), b"v2");

        // No temp files left behind next to the object.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (_dir, store) = make_store();
        match store.get("nope/missing.snapshot").await {
            Err(StorageError::NotFound { path }) => assert_eq!(path, "nope/missing.snapshot"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_then_exists_false() {
        let (_dir, store) = make_store();
        store.put("a/b/c.bin", b"x").await.unwrap();
        assert!(store.exists("a/b/c.bin").await.unwrap());
        store.delete("a/b/c.bin").await.unwrap();
        assert!(!store.exists("a/b/c.bin").await.unwrap());
        // deleting twice is fine
        store.delete("a/b/c.bin").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let (_dir, store) = make_store();
        let err = store.put("../outside", b"x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath { .. }));
    }
}
