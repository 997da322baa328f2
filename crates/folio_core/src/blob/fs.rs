//! Local filesystem blob storage.
//!
//! Blobs are stored under a base directory, sharded by the first two
//! characters of the content address to keep directories small:
//!
//! ```text
//! <base>/ab/abcdef0123…
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs as tokio_fs;

use super::storage::BlobStorage;
use crate::error::Result;

/// Blob storage backed by the local filesystem.
pub struct FsBlobStorage {
    base_dir: PathBuf,
}

impl FsBlobStorage {
    /// Create a storage rooted at `base_dir`, creating the directory if
    /// needed.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.exists() {
            tokio_fs::create_dir_all(&base_dir).await?;
        }
        Ok(Self { base_dir })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let prefix = if key.len() >= 2 { &key[..2] } else { "_" };
        self.base_dir.join(prefix).join(key)
    }

    async fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            tokio_fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for FsBlobStorage {
    fn name(&self) -> &str {
        "fs"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(key);
        match tokio_fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        self.ensure_parent(&path).await?;
        tokio_fs::write(&path, data).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.blob_path(key);
        match tokio_fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if !self.base_dir.exists() {
            return Ok(keys);
        }

        let mut shards = tokio_fs::read_dir(&self.base_dir).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.path().is_dir() {
                continue;
            }
            let mut entries = tokio_fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.path().is_file()
                    && let Some(name) = entry.file_name().to_str()
                {
                    keys.push(name.to_string());
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsBlobStorage::new(dir.path()).await.unwrap();

        storage.put("abcdef", b"payload").await.unwrap();
        assert_eq!(
            storage.get("abcdef").await.unwrap(),
            Some(b"payload".to_vec())
        );

        // sharded layout
        assert!(dir.path().join("ab").join("abcdef").exists());
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsBlobStorage::new(dir.path()).await.unwrap();
        assert_eq!(storage.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsBlobStorage::new(dir.path()).await.unwrap();

        storage.put("aa11", b"1").await.unwrap();
        storage.put("bb22", b"2").await.unwrap();

        let mut keys = storage.list().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["aa11", "bb22"]);

        storage.delete("aa11").await.unwrap();
        assert_eq!(storage.list().await.unwrap(), vec!["bb22"]);

        // deleting twice is fine
        storage.delete("aa11").await.unwrap();
    }
}
