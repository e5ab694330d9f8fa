use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use claimscope_state::{CasStore, ContentDigest, StorageError, StorageResult};
use tempfile::NamedTempFile;

/// Filesystem-backed artifact store with git-style 2-char sharding.
///
/// Layout: `<root>/objects/<first 2 hex chars>/<remaining hex chars>`
#[derive(Debug, Clone)]
pub struct FsCasStore {
    objects_dir: PathBuf,
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Backend(format!("artifact store io: {e}"))
}

impl FsCasStore {
    /// Creates `root/objects/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir).map_err(io_err)?;
        Ok(Self { objects_dir })
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.as_str();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    fn put_blocking(path: &Path, data: &[u8]) -> StorageResult<()> {
        if path.exists() {
            return Ok(());
        }
        let shard_dir = path
            .parent()
            .ok_or_else(|| StorageError::Backend(format!("no shard dir for {}", path.display())))?;
        fs::create_dir_all(shard_dir).map_err(io_err)?;

        // Same-directory temp file so the rename is atomic.
        let mut tmp = NamedTempFile::new_in(shard_dir).map_err(io_err)?;
        tmp.write_all(data).map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Backend(format!("artifact store task: {e}")))?
}

#[async_trait]
impl CasStore for FsCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let path = self.blob_path(&digest);
        let data = data.to_vec();
        blocking(move || Self::put_blocking(&path, &data)).await?;
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(digest);
        let missing = digest.to_string();
        blocking(move || {
            fs::read(&path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::NotFound { digest: missing }
                } else {
                    io_err(e)
                }
            })
        })
        .await
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        let path = self.blob_path(digest);
        blocking(move || Ok(path.exists())).await
    }

    async fn delete(&self, digest: &ContentDigest) -> StorageResult<()> {
        let path = self.blob_path(digest);
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsCasStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCasStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn blob_roundtrip() {
        let (_dir, store) = make_store();
        let digest = store.put(b"samples.jsonl contents").await.unwrap();
        assert_eq!(store.get(&digest).await.unwrap(), b"samples.jsonl contents");
        assert!(store.contains(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn identical_bytes_share_one_file() {
        let (dir, store) = make_store();
        let d1 = store.put(b"duplicate me").await.unwrap();
        let d2 = store.put(b"duplicate me").await.unwrap();
        assert_eq!(d1, d2);

        let shard = dir.path().join("objects").join(&d1.as_str()[..2]);
        assert_eq!(std::fs::read_dir(shard).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (_dir, store) = make_store();
        let fake = ContentDigest::from_bytes(b"no such blob");
        assert!(matches!(store.get(&fake).await, Err(StorageError::NotFound { .. })));
        assert!(!store.contains(&fake).await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = make_store();
        let digest = store.put(b"").await.unwrap();
        store.delete(&digest).await.unwrap();
        store.delete(&digest).await.unwrap();
        assert!(!store.contains(&digest).await.unwrap());
    }
}
