//! Backlink index over page/block references.
//!
//! Maps a referenced page (or block within one) to the set of
//! `(page id, block id)` locations referencing it. Maintained symmetrically
//! with the search index from the same block events, and rebuildable from a
//! full rescan.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::search::BlockAddr;
use crate::store::RefTarget;

/// Reverse reference index.
#[derive(Debug, Default)]
pub struct BacklinkIndexer {
    /// referenced target -> locations referencing it
    links: BTreeMap<RefTarget, BTreeSet<BlockAddr>>,
    /// block -> targets it references, for eviction
    block_refs: HashMap<BlockAddr, BTreeSet<RefTarget>>,
}

impl BacklinkIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a block's outgoing references.
    pub fn index_block(&mut self, page_id: &str, block_id: &str, references: &[RefTarget]) {
        let addr: BlockAddr = (page_id.to_string(), block_id.to_string());
        self.evict(&addr);

        let targets: BTreeSet<RefTarget> = references.iter().cloned().collect();
        if targets.is_empty() {
            return;
        }
        for target in &targets {
            self.links
                .entry(target.clone())
                .or_default()
                .insert(addr.clone());
        }
        self.block_refs.insert(addr, targets);
    }

    /// Drop a block's outgoing references.
    pub fn remove_block(&mut self, page_id: &str, block_id: &str) {
        let addr = (page_id.to_string(), block_id.to_string());
        self.evict(&addr);
    }

    /// Drop all references originating from a page.
    pub fn remove_page(&mut self, page_id: &str) {
        let addrs: Vec<BlockAddr> = self
            .block_refs
            .keys()
            .filter(|(page, _)| page == page_id)
            .cloned()
            .collect();
        for addr in addrs {
            self.evict(&addr);
        }
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.links.clear();
        self.block_refs.clear();
    }

    fn evict(&mut self, addr: &BlockAddr) {
        let Some(targets) = self.block_refs.remove(addr) else {
            return;
        };
        for target in targets {
            if let Some(set) = self.links.get_mut(&target) {
                set.remove(addr);
                if set.is_empty() {
                    self.links.remove(&target);
                }
            }
        }
    }

    /// Locations referencing exactly the given target.
    pub fn backlinks_to(&self, target: &RefTarget) -> Vec<BlockAddr> {
        self.links
            .get(target)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Locations referencing a page, whether the link points at the page
    /// itself or at any block within it.
    pub fn backlinks_to_page(&self, page_id: &str) -> Vec<BlockAddr> {
        let mut out: BTreeSet<BlockAddr> = BTreeSet::new();
        for (target, addrs) in &self.links {
            if target.page_id == page_id {
                out.extend(addrs.iter().cloned());
            }
        }
        out.into_iter().collect()
    }

    /// Snapshot of the full index contents, used to verify rebuild
    /// idempotence.
    pub fn entries(&self) -> &BTreeMap<RefTarget, BTreeSet<BlockAddr>> {
        &self.links
    }
}
