#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Content-addressed blob storage
pub mod blob;

/// Error (common error types)
pub mod error;

/// Search and backlink indexing
pub mod indexer;

/// Workspace metadata CRDT
pub mod meta;

/// Synchronization provider interface
pub mod provider;

/// Block schema registry
pub mod schema;

/// Snapshot import/export
pub mod snapshot;

/// Per-page block tree storage
pub mod store;

/// Workspace aggregate
pub mod workspace;

pub use error::{FolioError, Result};
pub use workspace::{Workspace, WorkspaceEvent, WorkspaceOptions};
