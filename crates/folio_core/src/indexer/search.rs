//! Full-text search index over block content.
//!
//! The index maps normalized tokens to the set of `(page id, block id)`
//! pairs containing them. It is purely derivative: replaying every block of
//! every page reproduces identical contents, which is what
//! `Workspace::reindex` does after corruption.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Location of an indexed block.
pub type BlockAddr = (String, String); // (page id, block id)

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Page containing the match.
    pub page_id: String,
    /// Matching block.
    pub block_id: String,
    /// Number of distinct query tokens the block matched.
    pub score: usize,
}

/// Normalize text into lowercase alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Inverted token index.
#[derive(Debug, Default)]
pub struct SearchIndexer {
    /// token -> blocks containing it
    postings: BTreeMap<String, BTreeSet<BlockAddr>>,
    /// block -> its current tokens, for eviction on update/remove
    block_tokens: HashMap<BlockAddr, BTreeSet<String>>,
}

impl SearchIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a block's postings with tokens from `text`.
    pub fn index_block(&mut self, page_id: &str, block_id: &str, text: &str) {
        let addr: BlockAddr = (page_id.to_string(), block_id.to_string());
        self.evict(&addr);

        let tokens: BTreeSet<String> = tokenize(text).into_iter().collect();
        if tokens.is_empty() {
            return;
        }
        for token in &tokens {
            self.postings
                .entry(token.clone())
                .or_default()
                .insert(addr.clone());
        }
        self.block_tokens.insert(addr, tokens);
    }

    /// Drop all postings for a block.
    pub fn remove_block(&mut self, page_id: &str, block_id: &str) {
        let addr = (page_id.to_string(), block_id.to_string());
        self.evict(&addr);
    }

    /// Drop all postings for a page.
    pub fn remove_page(&mut self, page_id: &str) {
        let addrs: Vec<BlockAddr> = self
            .block_tokens
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
        self.postings.clear();
        self.block_tokens.clear();
    }

    fn evict(&mut self, addr: &BlockAddr) {
        let Some(tokens) = self.block_tokens.remove(addr) else {
            return;
        };
        for token in tokens {
            if let Some(set) = self.postings.get_mut(&token) {
                set.remove(addr);
                if set.is_empty() {
                    self.postings.remove(&token);
                }
            }
        }
    }

    /// Search for blocks matching the query.
    ///
    /// Candidates matching any query token are ranked by the number of
    /// distinct tokens matched, ties broken by `(page id, block id)`.
    pub fn search(&self, query: &str) -> Vec<SearchResult> {
        let tokens: BTreeSet<String> = tokenize(query).into_iter().collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut scores: BTreeMap<BlockAddr, usize> = BTreeMap::new();
        for token in &tokens {
            if let Some(addrs) = self.postings.get(token) {
                for addr in addrs {
                    *scores.entry(addr.clone()).or_default() += 1;
                }
            }
        }

        let mut results: Vec<SearchResult> = scores
            .into_iter()
            .map(|((page_id, block_id), score)| SearchResult {
                page_id,
                block_id,
                score,
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.page_id.cmp(&b.page_id))
                .then(a.block_id.cmp(&b.block_id))
        });
        results
    }

    /// Snapshot of the full index contents, used to verify rebuild
    /// idempotence.
    pub fn entries(&self) -> &BTreeMap<String, BTreeSet<BlockAddr>> {
        &self.postings
    }
}
