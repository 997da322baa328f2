//! Content-addressed blob storage.
//!
//! [`BlobManager`] stores immutable binary objects keyed by the SHA-256 of
//! their content, fanned out across any number of pluggable backends.
//! Reads race every backend and take the first hit; writes and deletes go
//! to all backends and report a per-backend outcome rather than swallowing
//! partial failure.

mod fs;
mod memory;
mod storage;

pub use fs::FsBlobStorage;
pub use memory::MemoryBlobStorage;
pub use storage::BlobStorage;

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use sha2::{Digest, Sha256};

use crate::error::{FolioError, Result};

/// Result of one backend's participation in a fan-out write or delete.
#[derive(Debug, Clone)]
pub struct BackendOutcome {
    /// Backend name, as reported by [`BlobStorage::name`].
    pub backend: String,
    /// Error message if the backend failed; `None` on success.
    pub error: Option<String>,
}

impl BackendOutcome {
    /// Whether the backend succeeded.
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of storing a blob.
#[derive(Debug, Clone)]
pub struct BlobPutResult {
    /// Content address of the stored bytes.
    pub key: String,
    /// One outcome per backend, in registration order.
    pub outcomes: Vec<BackendOutcome>,
}

impl BlobPutResult {
    /// Whether at least one backend persisted the blob.
    pub fn any_ok(&self) -> bool {
        self.outcomes.iter().any(BackendOutcome::ok)
    }
}

/// Content-addressed blob storage over a set of backends.
pub struct BlobManager {
    backends: Vec<Arc<dyn BlobStorage>>,
}

impl BlobManager {
    /// Create a manager over the given backends. With an empty list a
    /// single in-memory backend is used.
    pub fn new(backends: Vec<Arc<dyn BlobStorage>>) -> Self {
        let backends = if backends.is_empty() {
            vec![Arc::new(MemoryBlobStorage::new()) as Arc<dyn BlobStorage>]
        } else {
            backends
        };
        Self { backends }
    }

    /// Compute the content address for a byte string.
    pub fn content_address(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Fetch a blob by key.
    ///
    /// Issues the read to every backend concurrently and resolves with the
    /// first hit. `Ok(None)` means every backend definitively reported the
    /// key absent; [`FolioError::BackendUnavailable`] means every backend
    /// errored.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut reads: FuturesUnordered<_> = self
            .backends
            .iter()
            .map(|backend| {
                let backend = Arc::clone(backend);
                let key = key.to_string();
                async move { (backend.name().to_string(), backend.get(&key).await) }
            })
            .collect();

        let mut errors = Vec::new();
        let mut misses = 0usize;
        while let Some((name, result)) = reads.next().await {
            match result {
                Ok(Some(data)) => return Ok(Some(data)),
                Ok(None) => misses += 1,
                Err(e) => {
                    log::warn!("blob backend '{name}' failed get({key}): {e}");
                    errors.push(format!("{name}: {e}"));
                }
            }
        }

        if misses == 0 && !errors.is_empty() {
            return Err(FolioError::BackendUnavailable(errors.join("; ")));
        }
        Ok(None)
    }

    /// Store a blob, returning its content address and per-backend
    /// outcomes.
    ///
    /// The write is a best-effort fan-out: the key is returned even when
    /// some backends fail, and callers can inspect `outcomes` to learn
    /// which.
    pub async fn put(&self, data: &[u8]) -> Result<BlobPutResult> {
        let key = Self::content_address(data);
        let writes = self.backends.iter().map(|backend| {
            let backend = Arc::clone(backend);
            let key = key.clone();
            async move {
                let result = backend.put(&key, data).await;
                outcome_of(backend.name(), result)
            }
        });
        let outcomes = futures_util::future::join_all(writes).await;

        for outcome in outcomes.iter().filter(|o| !o.ok()) {
            log::warn!(
                "blob backend '{}' failed put({key}): {}",
                outcome.backend,
                outcome.error.as_deref().unwrap_or_default()
            );
        }

        Ok(BlobPutResult { key, outcomes })
    }

    /// Delete a blob from every backend, reporting per-backend outcomes.
    pub async fn delete(&self, key: &str) -> Result<Vec<BackendOutcome>> {
        let deletes = self.backends.iter().map(|backend| {
            let backend = Arc::clone(backend);
            let key = key.to_string();
            async move {
                let result = backend.delete(&key).await;
                outcome_of(backend.name(), result)
            }
        });
        let outcomes = futures_util::future::join_all(deletes).await;

        for outcome in outcomes.iter().filter(|o| !o.ok()) {
            log::warn!(
                "blob backend '{}' failed delete({key}): {}",
                outcome.backend,
                outcome.error.as_deref().unwrap_or_default()
            );
        }
        Ok(outcomes)
    }

    /// Union of keys across all backends, deduplicated and sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let lists = self.backends.iter().map(|backend| {
            let backend = Arc::clone(backend);
            async move { (backend.name().to_string(), backend.list().await) }
        });
        let results = futures_util::future::join_all(lists).await;

        let mut keys = BTreeSet::new();
        for (name, result) in results {
            match result {
                Ok(list) => keys.extend(list),
                Err(e) => log::warn!("blob backend '{name}' failed list: {e}"),
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Number of registered backends.
    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }
}

fn outcome_of(name: &str, result: Result<()>) -> BackendOutcome {
    BackendOutcome {
        backend: name.to_string(),
        error: result.err().map(|e| e.to_string()),
    }
}

impl std::fmt::Debug for BlobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobManager")
            .field("backends", &self.backend_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Backend that fails every operation, for fan-out behavior tests.
    struct BrokenStorage;

    #[async_trait]
    impl BlobStorage for BrokenStorage {
        fn name(&self) -> &str {
            "broken"
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(FolioError::Io(std::io::Error::other("backend offline")))
        }

        async fn put(&self, _key: &str, _data: &[u8]) -> Result<()> {
            Err(FolioError::Io(std::io::Error::other("backend offline")))
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(FolioError::Io(std::io::Error::other("backend offline")))
        }

        async fn list(&self) -> Result<Vec<String>> {
            Err(FolioError::Io(std::io::Error::other("backend offline")))
        }
    }

    fn manager_with_memory() -> BlobManager {
        BlobManager::new(vec![Arc::new(MemoryBlobStorage::new())])
    }

    #[test]
    fn test_content_address_is_deterministic() {
        let a = BlobManager::content_address(b"same bytes");
        let b = BlobManager::content_address(b"same bytes");
        assert_eq!(a, b);

        let c = BlobManager::content_address(b"same bytes!");
        assert_ne!(a, c);

        // lowercase hex sha-256
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let manager = manager_with_memory();
        let result = manager.put(b"hello blob").await.unwrap();
        assert!(result.any_ok());

        let data = manager.get(&result.key).await.unwrap();
        assert_eq!(data, Some(b"hello blob".to_vec()));
    }

    #[tokio::test]
    async fn test_same_bytes_same_key() {
        let manager = manager_with_memory();
        let first = manager.put(b"dedup me").await.unwrap();
        let second = manager.put(b"dedup me").await.unwrap();
        assert_eq!(first.key, second.key);
        assert_eq!(manager.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_races_past_broken_backend() {
        let manager = BlobManager::new(vec![
            Arc::new(BrokenStorage),
            Arc::new(MemoryBlobStorage::new()),
        ]);
        let result = manager.put(b"resilient").await.unwrap();

        // one backend failed the write, one took it
        assert_eq!(result.outcomes.len(), 2);
        assert!(result.outcomes.iter().any(|o| o.ok()));
        assert!(result.outcomes.iter().any(|o| !o.ok()));

        // the read still succeeds through the healthy backend
        let data = manager.get(&result.key).await.unwrap();
        assert_eq!(data, Some(b"resilient".to_vec()));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let manager = BlobManager::new(vec![
            Arc::new(BrokenStorage),
            Arc::new(MemoryBlobStorage::new()),
        ]);
        // one error + one definitive miss -> not found, not unavailable
        assert_eq!(manager.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_all_backends_failing_is_unavailable() {
        let manager = BlobManager::new(vec![Arc::new(BrokenStorage), Arc::new(BrokenStorage)]);
        let err = manager.get("anything").await.unwrap_err();
        assert!(matches!(err, FolioError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_delete_reports_outcomes() {
        let manager = BlobManager::new(vec![
            Arc::new(MemoryBlobStorage::new()),
            Arc::new(BrokenStorage),
        ]);
        let result = manager.put(b"to delete").await.unwrap();
        let outcomes = manager.delete(&result.key).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().any(|o| o.ok()));
        assert!(outcomes.iter().any(|o| !o.ok()));
        assert_eq!(manager.get(&result.key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_unions_backends() {
        let first = Arc::new(MemoryBlobStorage::new());
        let second = Arc::new(MemoryBlobStorage::new());
        first.put("aaa", b"1").await.unwrap();
        second.put("bbb", b"2").await.unwrap();
        second.put("aaa", b"1").await.unwrap();

        let manager = BlobManager::new(vec![first, second]);
        assert_eq!(manager.list().await.unwrap(), vec!["aaa", "bbb"]);
    }
}
