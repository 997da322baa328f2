use thiserror::Error;

/// Unified error type for folio operations
#[derive(Debug, Error)]
pub enum FolioError {
    // Workspace errors
    #[error("page '{0}' not found")]
    PageNotFound(String),

    #[error("page '{0}' already exists")]
    PageAlreadyExists(String),

    #[error("page '{0}' is not loaded")]
    PageNotLoaded(String),

    // Block tree errors
    #[error("block '{0}' not found")]
    BlockNotFound(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("moving block '{block}' under '{new_parent}' would create a cycle")]
    CycleDetected { block: String, new_parent: String },

    // Snapshot errors
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    // Blob errors
    #[error("blob '{0}' not found")]
    BlobNotFound(String),

    #[error("all blob backends failed: {0}")]
    BackendUnavailable(String),

    // CRDT errors (decode/apply failures surfaced from yrs)
    #[error("CRDT error: {0}")]
    Crdt(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for folio operations
pub type Result<T> = std::result::Result<T, FolioError>;
