//! Incremental search and backlink indexing.
//!
//! The [`Indexer`] subscribes to block events from every live page (the
//! workspace wires the subscriptions) and keeps both derived indexes in
//! step. Index state is never authoritative: a full rescan of all pages
//! reproduces it exactly.

mod backlink;
mod search;

pub use backlink::BacklinkIndexer;
pub use search::{BlockAddr, SearchIndexer, SearchResult, tokenize};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use crate::store::{BlockChange, RefTarget};

/// Search and backlink indexes maintained from block events.
///
/// Methods take `&self`; interior locks let event subscribers feed the
/// indexer concurrently with queries.
#[derive(Debug, Default)]
pub struct Indexer {
    search: RwLock<SearchIndexer>,
    backlink: RwLock<BacklinkIndexer>,
}

impl Indexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one block change from the given page.
    pub fn apply(&self, page_id: &str, change: &BlockChange) {
        match change {
            BlockChange::Added(record) | BlockChange::Updated(record) => {
                self.search
                    .write()
                    .unwrap()
                    .index_block(page_id, &record.id, &record.text);
                self.backlink.write().unwrap().index_block(
                    page_id,
                    &record.id,
                    &record.references,
                );
            }
            BlockChange::Removed { id, .. } => {
                self.search.write().unwrap().remove_block(page_id, id);
                self.backlink.write().unwrap().remove_block(page_id, id);
            }
        }
    }

    /// Evict everything a page contributed, used at page teardown.
    pub fn remove_page(&self, page_id: &str) {
        self.search.write().unwrap().remove_page(page_id);
        self.backlink.write().unwrap().remove_page(page_id);
    }

    /// Drop all index state. Callers are expected to replay the stores
    /// afterwards.
    pub fn clear(&self) {
        self.search.write().unwrap().clear();
        self.backlink.write().unwrap().clear();
    }

    /// Query the search index.
    pub fn search(&self, query: &str) -> Vec<SearchResult> {
        self.search.read().unwrap().search(query)
    }

    /// Query the backlink index for an exact target.
    pub fn backlinks_to(&self, target: &RefTarget) -> Vec<BlockAddr> {
        self.backlink.read().unwrap().backlinks_to(target)
    }

    /// Query the backlink index for anything referencing a page.
    pub fn backlinks_to_page(&self, page_id: &str) -> Vec<BlockAddr> {
        self.backlink.read().unwrap().backlinks_to_page(page_id)
    }

    /// Cloned snapshot of both index contents, used to verify rebuild
    /// idempotence in tests.
    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            search: self.search.read().unwrap().entries().clone(),
            backlink: self.backlink.read().unwrap().entries().clone(),
        }
    }
}

/// Deterministic copy of the full index contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub search: BTreeMap<String, BTreeSet<BlockAddr>>,
    pub backlink: BTreeMap<RefTarget, BTreeSet<BlockAddr>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlockRecord;

    fn added(id: &str, text: &str, references: Vec<RefTarget>) -> BlockChange {
        BlockChange::Added(BlockRecord {
            id: id.to_string(),
            flavour: "folio:paragraph".to_string(),
            text: text.to_string(),
            references,
        })
    }

    #[test]
    fn test_apply_add_then_remove() {
        let indexer = Indexer::new();
        indexer.apply("p1", &added("b1", "hello world", vec![RefTarget::page("p2")]));

        assert_eq!(indexer.search("hello").len(), 1);
        assert_eq!(indexer.backlinks_to(&RefTarget::page("p2")).len(), 1);

        indexer.apply(
            "p1",
            &BlockChange::Removed {
                id: "b1".to_string(),
                flavour: "folio:paragraph".to_string(),
            },
        );
        assert!(indexer.search("hello").is_empty());
        assert!(indexer.backlinks_to(&RefTarget::page("p2")).is_empty());
    }

    #[test]
    fn test_clear_and_replay_reproduces_snapshot() {
        let indexer = Indexer::new();
        let changes = vec![
            added("b1", "alpha beta", vec![RefTarget::page("px")]),
            added("b2", "beta gamma", vec![]),
            added("b3", "gamma delta", vec![RefTarget::block("px", "by")]),
        ];
        for change in &changes {
            indexer.apply("p1", change);
        }
        let before = indexer.snapshot();

        indexer.clear();
        // replay in a different order; derived state must not care
        for change in changes.iter().rev() {
            indexer.apply("p1", change);
        }
        assert_eq!(indexer.snapshot(), before);
    }

    #[test]
    fn test_remove_page_evicts_both_indexes() {
        let indexer = Indexer::new();
        indexer.apply("p1", &added("b1", "text", vec![RefTarget::page("p2")]));
        indexer.apply("p3", &added("b2", "text", vec![]));

        indexer.remove_page("p1");
        let results = indexer.search("text");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].page_id, "p3");
        assert!(indexer.backlinks_to_page("p2").is_empty());
    }
}
