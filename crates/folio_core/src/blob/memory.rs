//! In-memory blob storage, the default backend and the one tests use.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::storage::BlobStorage;
use crate::error::Result;

/// Blob storage backed by a process-local map. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStorage {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.blobs.read().unwrap().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let storage = MemoryBlobStorage::new();

        storage.put("abc", b"payload").await.unwrap();
        assert_eq!(storage.get("abc").await.unwrap(), Some(b"payload".to_vec()));

        storage.delete("abc").await.unwrap();
        assert_eq!(storage.get("abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list() {
        let storage = MemoryBlobStorage::new();
        storage.put("a", b"1").await.unwrap();
        storage.put("b", b"2").await.unwrap();

        let mut keys = storage.list().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
