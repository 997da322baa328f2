//! Workspace metadata CRDT.
//!
//! This module provides [`WorkspaceMeta`], which wraps a yrs [`Doc`] holding
//! page existence and metadata, independent of any page's content document.
//!
//! # Structure
//!
//! The meta document contains a single Y.Map called "pages" mapping page
//! ids to their serialized [`PageMeta`]:
//!
//! ```text
//! Y.Doc
//! └── Y.Map "pages"
//!     ├── "3f2a…" → PageMeta { title: "Home", create_date, tags, ... }
//!     └── ...
//! ```
//!
//! Insertion and removal of entries in this map is the sole trigger for
//! page-store construction and teardown, whether the entry was written
//! locally or arrived from a peer.

use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Map, MapRef, Observable, ReadTxn, StateVector, Transact, Update};

use crate::error::{FolioError, Result};

/// The name of the Y.Map containing page metadata.
const PAGES_MAP_NAME: &str = "pages";

/// Metadata for a page, stored in the workspace meta document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMeta {
    /// Page id; matches the key in the pages map.
    pub id: String,

    /// Display title.
    #[serde(default)]
    pub title: String,

    /// Unix timestamp of creation (milliseconds).
    #[serde(rename = "createDate")]
    pub create_date: i64,

    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Hidden from listings when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
}

impl PageMeta {
    /// Create metadata for a new page, stamped with the current time.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            create_date: chrono::Utc::now().timestamp_millis(),
            tags: Vec::new(),
            hidden: None,
        }
    }
}

/// Partial update to a page's metadata.
#[derive(Debug, Clone, Default)]
pub struct PageMetaPatch {
    /// Replace the title.
    pub title: Option<String>,
    /// Replace the tag list.
    pub tags: Option<Vec<String>>,
    /// Set or clear the hidden flag.
    pub hidden: Option<bool>,
}

/// A CRDT document holding workspace page metadata.
pub struct WorkspaceMeta {
    doc: Doc,
    pages_map: MapRef,
}

impl WorkspaceMeta {
    /// Create a new empty meta document.
    pub fn new() -> Self {
        let doc = Doc::new();
        let pages_map = doc.get_or_insert_map(PAGES_MAP_NAME);
        Self { doc, pages_map }
    }

    /// The underlying yrs document, for providers and persistence.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    // ==================== Page Meta Operations ====================

    /// Get metadata for a page.
    pub fn get_page_meta(&self, page_id: &str) -> Option<PageMeta> {
        let txn = self.doc.transact();
        self.pages_map.get(&txn, page_id).and_then(|value| {
            let json = value.to_string(&txn);
            serde_json::from_str(&json).ok()
        })
    }

    /// Insert metadata for a page. Overwrites an existing entry.
    pub fn add_page_meta(&self, meta: PageMeta) {
        let mut txn = self.doc.transact_mut();
        let json = serde_json::to_string(&meta).unwrap_or_default();
        self.pages_map.insert(&mut txn, meta.id.as_str(), json);
    }

    /// Apply a partial update to a page's metadata.
    pub fn set_page_meta(&self, page_id: &str, patch: PageMetaPatch) -> Result<()> {
        let mut meta = self
            .get_page_meta(page_id)
            .ok_or_else(|| FolioError::PageNotFound(page_id.to_string()))?;
        if let Some(title) = patch.title {
            meta.title = title;
        }
        if let Some(tags) = patch.tags {
            meta.tags = tags;
        }
        if let Some(hidden) = patch.hidden {
            meta.hidden = Some(hidden);
        }
        self.add_page_meta(meta);
        Ok(())
    }

    /// Remove a page's metadata entry.
    pub fn remove_page_meta(&self, page_id: &str) {
        let mut txn = self.doc.transact_mut();
        self.pages_map.remove(&mut txn, page_id);
    }

    /// Whether a page meta entry exists.
    pub fn has_page(&self, page_id: &str) -> bool {
        let txn = self.doc.transact();
        self.pages_map.get(&txn, page_id).is_some()
    }

    /// All page metas, ordered by creation time then id.
    pub fn page_metas(&self) -> Vec<PageMeta> {
        let txn = self.doc.transact();
        let mut metas: Vec<PageMeta> = self
            .pages_map
            .iter(&txn)
            .filter_map(|(_, value)| {
                let json = value.to_string(&txn);
                serde_json::from_str(&json).ok()
            })
            .collect();
        metas.sort_by(|a, b| a.create_date.cmp(&b.create_date).then(a.id.cmp(&b.id)));
        metas
    }

    /// Number of pages (including hidden ones).
    pub fn page_count(&self) -> usize {
        let txn = self.doc.transact();
        self.pages_map.len(&txn) as usize
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for a sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full document state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode only the updates the remote peer is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| FolioError::Crdt(format!("Failed to decode state vector: {e}")))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update from a remote peer.
    ///
    /// Newly arrived page entries fire the same observer used for local
    /// additions.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| FolioError::Crdt(format!("Failed to decode update: {e}")))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| FolioError::Crdt(format!("Failed to apply update: {e}")))?;
        Ok(())
    }

    // ==================== Observers ====================

    /// Subscribe to page meta changes.
    ///
    /// The callback receives the page id and new metadata (or `None` when
    /// the entry was removed) for each changed page. Returns a subscription
    /// that unsubscribes when dropped.
    pub fn observe_pages<F>(&self, callback: F) -> yrs::Subscription
    where
        F: Fn(Vec<(String, Option<PageMeta>)>) + Send + Sync + 'static,
    {
        self.pages_map.observe(move |txn, event| {
            let changes: Vec<(String, Option<PageMeta>)> = event
                .keys(txn)
                .iter()
                .map(|(key, change)| {
                    let page_id = key.to_string();
                    match change {
                        yrs::types::EntryChange::Inserted(value)
                        | yrs::types::EntryChange::Updated(_, value) => {
                            let json = value.clone().cast::<String>().unwrap_or_default();
                            let meta: Option<PageMeta> = serde_json::from_str(&json).ok();
                            (page_id, meta)
                        }
                        yrs::types::EntryChange::Removed(_) => (page_id, None),
                    }
                })
                .collect();

            if !changes.is_empty() {
                callback(changes);
            }
        })
    }
}

impl Default for WorkspaceMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkspaceMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceMeta")
            .field("page_count", &self.page_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_new_meta_is_empty() {
        let meta = WorkspaceMeta::new();
        assert_eq!(meta.page_count(), 0);
        assert!(meta.page_metas().is_empty());
    }

    #[test]
    fn test_add_and_get_page_meta() {
        let meta = WorkspaceMeta::new();
        let mut page = PageMeta::new("p1");
        page.title = "Home".to_string();
        meta.add_page_meta(page);

        let loaded = meta.get_page_meta("p1").unwrap();
        assert_eq!(loaded.title, "Home");
        assert!(loaded.create_date > 0);
        assert!(meta.has_page("p1"));
        assert!(!meta.has_page("p2"));
    }

    #[test]
    fn test_set_page_meta_patch() {
        let meta = WorkspaceMeta::new();
        meta.add_page_meta(PageMeta::new("p1"));

        meta.set_page_meta(
            "p1",
            PageMetaPatch {
                title: Some("Renamed".to_string()),
                tags: Some(vec!["journal".to_string()]),
                hidden: None,
            },
        )
        .unwrap();

        let loaded = meta.get_page_meta("p1").unwrap();
        assert_eq!(loaded.title, "Renamed");
        assert_eq!(loaded.tags, vec!["journal"]);
        assert_eq!(loaded.hidden, None);
    }

    #[test]
    fn test_set_page_meta_missing_page() {
        let meta = WorkspaceMeta::new();
        let err = meta.set_page_meta("ghost", PageMetaPatch::default()).unwrap_err();
        assert!(matches!(err, FolioError::PageNotFound(_)));
    }

    #[test]
    fn test_remove_page_meta() {
        let meta = WorkspaceMeta::new();
        meta.add_page_meta(PageMeta::new("p1"));
        meta.remove_page_meta("p1");
        assert!(meta.get_page_meta("p1").is_none());
        assert_eq!(meta.page_count(), 0);
    }

    #[test]
    fn test_page_metas_ordered_by_create_date() {
        let meta = WorkspaceMeta::new();
        let mut first = PageMeta::new("b");
        first.create_date = 100;
        let mut second = PageMeta::new("a");
        second.create_date = 200;
        meta.add_page_meta(second);
        meta.add_page_meta(first);

        let ids: Vec<String> = meta.page_metas().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_meta_sync_between_replicas() {
        let meta1 = WorkspaceMeta::new();
        let meta2 = WorkspaceMeta::new();

        meta1.add_page_meta(PageMeta::new("p1"));
        meta2.apply_update(&meta1.encode_state_as_update()).unwrap();

        assert!(meta2.has_page("p1"));

        // diff path
        meta1.add_page_meta(PageMeta::new("p2"));
        let diff = meta1.encode_diff(&meta2.encode_state_vector()).unwrap();
        meta2.apply_update(&diff).unwrap();
        assert_eq!(meta2.page_count(), 2);
    }

    #[test]
    fn test_observer_fires_for_remote_arrivals() {
        let meta1 = WorkspaceMeta::new();
        let meta2 = WorkspaceMeta::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = meta2.observe_pages(move |changes| {
            seen_clone.lock().unwrap().extend(changes);
        });

        meta1.add_page_meta(PageMeta::new("p1"));
        meta2.apply_update(&meta1.encode_state_as_update()).unwrap();
        meta2.remove_page_meta("p1");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "p1");
        assert!(seen[0].1.is_some());
        assert!(seen[1].1.is_none());
    }
}
