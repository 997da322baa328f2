//! Storage backend abstraction for blobs.

use async_trait::async_trait;

use crate::error::Result;

/// A single blob storage backend.
///
/// Backends are content-addressed key/value stores; the manager computes
/// keys and fans operations out across every registered backend, so an
/// implementation only needs straightforward get/put/delete/list.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Human-readable backend name, used in logs and per-backend outcomes.
    fn name(&self) -> &str;

    /// Fetch a blob. `Ok(None)` means the backend definitively does not
    /// hold the key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a blob under the given content address.
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Delete a blob. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys held by this backend.
    async fn list(&self) -> Result<Vec<String>>;
}
