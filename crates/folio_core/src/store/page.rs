//! Per-page block tree CRDT.
//!
//! This module provides [`Page`], a yrs [`Doc`] holding one tree of blocks.
//!
//! # Structure
//!
//! The page document contains a single Y.Map called "blocks" mapping block
//! ids to block entries:
//!
//! ```text
//! Y.Doc
//! └── Y.Map "blocks"
//!     ├── "a1b2" → Y.Map { sys:id, sys:flavour, sys:children: Y.Array,
//!     │                    sys:version, prop:text: Y.Text, prop:* }
//!     └── ...
//! ```
//!
//! A block's parent is implicit: it is the one block whose `sys:children`
//! array contains the block's id. The page maintains a model cache mirroring
//! that topology so `get_parent`/`children` are O(1) and bulk removals can
//! be reported children-before-parents.
//!
//! # Events
//!
//! All mutations go through yrs transactions; a deep observer on the blocks
//! map translates committed transactions into [`BlockChange`] events. Binary
//! updates applied from a provider run through the same observer, so remote
//! and local mutations are indistinguishable to subscribers.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use indexmap::IndexMap;
use yrs::types::text::YChange;
use yrs::types::{Change, EntryChange, Event, Events, PathSegment};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, DeepObservable, Doc, GetString, Map, MapPrelim, MapRef,
    Out, ReadTxn, StateVector, Text, TextPrelim, TextRef, Transact, TransactionMut, Update,
};

use super::events::{BlockChange, BlockRecord, EventSubscription, Subscribers};
use super::id::IdGenerator;
use super::types::{
    self, BlockView, PropValue, RefTarget, TextDelta, TextSpan,
};
use crate::error::{FolioError, Result};
use crate::schema::{BlockRole, Schema};

/// Name of the Y.Map holding all blocks of a page.
const BLOCKS_MAP_NAME: &str = "blocks";

const SYS_ID: &str = "sys:id";
const SYS_FLAVOUR: &str = "sys:flavour";
const SYS_CHILDREN: &str = "sys:children";
const SYS_VERSION: &str = "sys:version";
const PROP_PREFIX: &str = "prop:";

/// Rich-text property created for flavours with textual content.
const TEXT_PROP: &str = "text";

/// Lifecycle state of a page store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Constructed but not yet loaded; mutations are rejected.
    Created,
    /// Fully usable.
    Loaded,
    /// Torn down; all subscriptions detached. Terminal.
    Disposed,
}

#[derive(Debug, Clone)]
struct TreeNode {
    flavour: String,
    parent: Option<String>,
    children: Vec<String>,
}

#[derive(Debug, Default)]
struct TreeCache {
    nodes: HashMap<String, TreeNode>,
    root: Option<String>,
}

impl TreeCache {
    fn depth(&self, id: &str) -> usize {
        let mut depth = 0;
        let mut current = id;
        while let Some(node) = self.nodes.get(current) {
            match &node.parent {
                Some(parent) => {
                    depth += 1;
                    current = parent;
                    // tolerate transiently inconsistent parent chains
                    if depth > self.nodes.len() {
                        break;
                    }
                }
                None => break,
            }
        }
        depth
    }

    fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        let mut current = id.to_string();
        let mut hops = 0;
        while let Some(node) = self.nodes.get(&current) {
            match &node.parent {
                Some(parent) if parent == ancestor => return true,
                Some(parent) => {
                    current = parent.clone();
                    hops += 1;
                    if hops > self.nodes.len() {
                        return false;
                    }
                }
                None => return false,
            }
        }
        false
    }

    /// Subtree ids with children listed before their parent.
    fn subtree_postorder(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.visit_postorder(id, &mut out);
        out
    }

    fn visit_postorder(&self, id: &str, out: &mut Vec<String>) {
        if let Some(node) = self.nodes.get(id) {
            for child in node.children.clone() {
                self.visit_postorder(&child, out);
            }
        }
        out.push(id.to_string());
    }

    /// All ids in root-first depth-first order; unreachable blocks follow,
    /// sorted by id, each with its own subtree.
    fn dfs_order(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut push_subtree = |start: &str, out: &mut Vec<String>, seen: &mut BTreeSet<String>| {
            let mut stack = vec![start.to_string()];
            while let Some(id) = stack.pop() {
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(node) = self.nodes.get(&id) {
                    for child in node.children.iter().rev() {
                        stack.push(child.clone());
                    }
                }
                out.push(id);
            }
        };

        if let Some(root) = &self.root {
            push_subtree(root, &mut out, &mut seen);
        }
        let mut stray: Vec<String> = self
            .nodes
            .iter()
            .filter(|(id, node)| node.parent.is_none() && !seen.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();
        stray.sort();
        for id in stray {
            push_subtree(&id, &mut out, &mut seen);
        }
        out
    }
}

/// Simplified child-array delta captured from a yrs array event.
enum ChildOp {
    Retain(usize),
    Insert(Vec<String>),
    Remove(usize),
}

/// A single replicated page document exposing tree mutations over blocks.
///
/// Cheap to clone; clones share the same underlying document.
#[derive(Clone)]
pub struct Page {
    inner: Arc<PageInner>,
}

pub(crate) struct PageInner {
    id: String,
    doc: Doc,
    blocks: MapRef,
    schema: Arc<Schema>,
    id_gen: Arc<dyn IdGenerator>,
    state: RwLock<PageState>,
    tree: RwLock<TreeCache>,
    subscribers: Arc<Subscribers>,
    deep_sub: Mutex<Option<yrs::Subscription>>,
}

impl Page {
    /// Create a new, empty page document in the `Created` state.
    pub fn new(id: impl Into<String>, schema: Arc<Schema>, id_gen: Arc<dyn IdGenerator>) -> Self {
        let doc = Doc::new();
        let blocks = doc.get_or_insert_map(BLOCKS_MAP_NAME);
        Self {
            inner: Arc::new(PageInner {
                id: id.into(),
                doc,
                blocks,
                schema,
                id_gen,
                state: RwLock::new(PageState::Created),
                tree: RwLock::new(TreeCache::default()),
                subscribers: Arc::new(Subscribers::default()),
                deep_sub: Mutex::new(None),
            }),
        }
    }

    /// Page id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The underlying yrs document, for providers and persistence.
    pub fn doc(&self) -> &Doc {
        &self.inner.doc
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PageState {
        *self.inner.state.read().unwrap()
    }

    /// Whether the page has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.state() == PageState::Disposed
    }

    // ==================== Lifecycle ====================

    /// Transition the page to `Loaded`.
    ///
    /// Installs the change observer, seeds the model cache from whatever
    /// state the document already holds (e.g. updates applied by a provider
    /// before load) and reports every existing block as added. Idempotent
    /// while loaded; fails once disposed.
    pub fn load(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write().unwrap();
            match *state {
                PageState::Loaded => return Ok(()),
                PageState::Disposed => {
                    return Err(FolioError::PageNotLoaded(self.inner.id.clone()));
                }
                PageState::Created => *state = PageState::Loaded,
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let sub = self.inner.blocks.observe_deep(move |txn, events| {
            if let Some(inner) = weak.upgrade() {
                inner.process_events(txn, events);
            }
        });
        *self.inner.deep_sub.lock().unwrap() = Some(sub);

        // Seed the cache and announce pre-existing blocks.
        let records = {
            let txn = self.inner.doc.transact();
            let mut tree = self.inner.tree.write().unwrap();
            *tree = self.inner.build_cache(&txn);
            tree.dfs_order()
                .into_iter()
                .filter_map(|id| self.inner.read_record(&txn, &id))
                .collect::<Vec<_>>()
        };
        for record in records {
            self.inner.subscribers.emit(&BlockChange::Added(record));
        }
        Ok(())
    }

    /// Tear the page down: detach the observer and all subscribers.
    ///
    /// Idempotent; calling it again is a no-op.
    pub fn dispose(&self) {
        {
            let mut state = self.inner.state.write().unwrap();
            if *state == PageState::Disposed {
                return;
            }
            *state = PageState::Disposed;
        }
        *self.inner.deep_sub.lock().unwrap() = None;
        self.inner.subscribers.clear();
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.state() != PageState::Loaded {
            return Err(FolioError::PageNotLoaded(self.inner.id.clone()));
        }
        Ok(())
    }

    // ==================== Tree Mutation ====================

    /// Insert a new block and return its id.
    ///
    /// The flavour must be registered and allowed under the parent's
    /// flavour; `parent` of `None` is only valid for the root flavour.
    /// `index` positions the block within the parent's children (clamped;
    /// default append).
    pub fn add_block(
        &self,
        flavour: &str,
        props: IndexMap<String, PropValue>,
        parent: Option<&str>,
        index: Option<u32>,
    ) -> Result<String> {
        self.ensure_loaded()?;
        let id = self.inner.id_gen.next_id();
        self.insert_block_inner(&id, flavour, props, parent, index)?;
        Ok(id)
    }

    /// Insert a block under a caller-supplied id, appending to the parent.
    ///
    /// Used by snapshot import, where child relationships in the snapshot
    /// are expressed through the original ids. Existing ids are skipped.
    pub(crate) fn insert_block_with_id(
        &self,
        id: &str,
        flavour: &str,
        props: IndexMap<String, PropValue>,
        parent: Option<&str>,
    ) -> Result<()> {
        self.ensure_loaded()?;
        if self.has_block(id) {
            log::warn!("skipping duplicate block id '{id}' on page '{}'", self.inner.id);
            return Ok(());
        }
        self.insert_block_inner(id, flavour, props, parent, None)
    }

    fn insert_block_inner(
        &self,
        id: &str,
        flavour: &str,
        props: IndexMap<String, PropValue>,
        parent: Option<&str>,
        index: Option<u32>,
    ) -> Result<()> {
        let parent_flavour = match parent {
            Some(pid) => {
                let tree = self.inner.tree.read().unwrap();
                let node = tree
                    .nodes
                    .get(pid)
                    .ok_or_else(|| FolioError::BlockNotFound(pid.to_string()))?;
                Some(node.flavour.clone())
            }
            None => None,
        };
        let block_schema = self
            .inner
            .schema
            .validate_placement(flavour, parent_flavour.as_deref())?;

        if block_schema.role == BlockRole::Root
            && self.inner.tree.read().unwrap().root.is_some()
        {
            return Err(FolioError::SchemaViolation(format!(
                "page '{}' already has a root block",
                self.inner.id
            )));
        }

        // Defaults sit under caller-provided props.
        let mut merged = block_schema.defaults.clone();
        for (key, value) in props {
            merged.insert(key, value);
        }

        {
            let mut txn = self.inner.doc.transact_mut();
            let block = self
                .inner
                .blocks
                .insert(&mut txn, id, MapPrelim::default());
            block.insert(&mut txn, SYS_ID, id);
            block.insert(&mut txn, SYS_FLAVOUR, flavour);
            block.insert(&mut txn, SYS_VERSION, 1i64);
            block.insert(&mut txn, SYS_CHILDREN, ArrayPrelim::default());

            let mut has_text = false;
            for (key, value) in &merged {
                if key == TEXT_PROP && matches!(value, PropValue::Text(_)) {
                    has_text = true;
                }
                write_prop(&mut txn, &block, key, value);
            }
            if block_schema.has_text && !has_text {
                block.insert(
                    &mut txn,
                    format!("{PROP_PREFIX}{TEXT_PROP}").as_str(),
                    TextPrelim::new(""),
                );
            }

            if let Some(pid) = parent {
                let children = self
                    .inner
                    .children_array(&txn, pid)
                    .ok_or_else(|| FolioError::BlockNotFound(pid.to_string()))?;
                let len = children.len(&txn);
                let at = index.unwrap_or(len).min(len);
                children.insert(&mut txn, at, id);
            }
        }

        Ok(())
    }

    /// Merge the given keys into a block's properties.
    ///
    /// Conflict resolution is last-write-wins per key at the CRDT layer.
    pub fn update_block(&self, id: &str, props: IndexMap<String, PropValue>) -> Result<()> {
        self.ensure_loaded()?;
        if !self.inner.tree.read().unwrap().nodes.contains_key(id) {
            return Err(FolioError::BlockNotFound(id.to_string()));
        }

        let mut txn = self.inner.doc.transact_mut();
        let block = self
            .inner
            .block_map(&txn, id)
            .ok_or_else(|| FolioError::BlockNotFound(id.to_string()))?;
        for (key, value) in &props {
            write_prop(&mut txn, &block, key, value);
        }
        Ok(())
    }

    /// Remove a block and all of its descendants.
    ///
    /// Removal events are dispatched children-before-parents so indexers
    /// see leaves before their containers disappear. Ids are never reused.
    pub fn delete_block(&self, id: &str) -> Result<()> {
        self.ensure_loaded()?;
        let (subtree, parent) = {
            let tree = self.inner.tree.read().unwrap();
            if !tree.nodes.contains_key(id) {
                return Err(FolioError::BlockNotFound(id.to_string()));
            }
            (
                tree.subtree_postorder(id),
                tree.nodes[id].parent.clone(),
            )
        };

        let mut txn = self.inner.doc.transact_mut();
        if let Some(pid) = parent
            && let Some(children) = self.inner.children_array(&txn, &pid)
            && let Some(at) = position_of(&txn, &children, id)
        {
            children.remove(&mut txn, at);
        }
        for block_id in &subtree {
            self.inner.blocks.remove(&mut txn, block_id);
        }
        Ok(())
    }

    /// Move a block under a new parent, atomically.
    ///
    /// Fails with [`FolioError::CycleDetected`] when `new_parent` is the
    /// block itself or one of its descendants.
    pub fn move_block(&self, id: &str, new_parent: &str, index: Option<u32>) -> Result<()> {
        self.ensure_loaded()?;

        let (old_parent, flavour, new_parent_flavour) = {
            let tree = self.inner.tree.read().unwrap();
            let node = tree
                .nodes
                .get(id)
                .ok_or_else(|| FolioError::BlockNotFound(id.to_string()))?;
            let target = tree
                .nodes
                .get(new_parent)
                .ok_or_else(|| FolioError::BlockNotFound(new_parent.to_string()))?;
            if id == new_parent || tree.is_ancestor(id, new_parent) {
                return Err(FolioError::CycleDetected {
                    block: id.to_string(),
                    new_parent: new_parent.to_string(),
                });
            }
            (node.parent.clone(), node.flavour.clone(), target.flavour.clone())
        };
        self.inner
            .schema
            .validate_placement(&flavour, Some(&new_parent_flavour))?;

        let mut txn = self.inner.doc.transact_mut();
        if let Some(pid) = old_parent
            && let Some(children) = self.inner.children_array(&txn, &pid)
            && let Some(at) = position_of(&txn, &children, id)
        {
            children.remove(&mut txn, at);
        }
        let children = self
            .inner
            .children_array(&txn, new_parent)
            .ok_or_else(|| FolioError::BlockNotFound(new_parent.to_string()))?;
        let len = children.len(&txn);
        let at = index.unwrap_or(len).min(len);
        children.insert(&mut txn, at, id);
        Ok(())
    }

    /// Remove every block from the page in one transaction.
    pub fn clear(&self) -> Result<()> {
        self.ensure_loaded()?;
        let ids: Vec<String> = {
            let tree = self.inner.tree.read().unwrap();
            tree.nodes.keys().cloned().collect()
        };
        let mut txn = self.inner.doc.transact_mut();
        for id in ids {
            self.inner.blocks.remove(&mut txn, &id);
        }
        Ok(())
    }

    // ==================== Reads ====================

    /// Materialize a block, or `None` if absent.
    pub fn get_block(&self, id: &str) -> Option<BlockView> {
        let txn = self.inner.doc.transact();
        let block = self.inner.block_map(&txn, id)?;
        let tree = self.inner.tree.read().unwrap();
        let node = tree.nodes.get(id)?;

        let mut props: Vec<(String, PropValue)> = Vec::new();
        for (key, value) in block.iter(&txn) {
            if let Some(name) = key.strip_prefix(PROP_PREFIX) {
                props.push((name.to_string(), read_prop(&txn, &value)));
            }
        }
        props.sort_by(|(a, _), (b, _)| a.cmp(b));

        Some(BlockView {
            id: id.to_string(),
            flavour: node.flavour.clone(),
            children: node.children.clone(),
            props: props.into_iter().collect(),
        })
    }

    /// Whether a block exists.
    pub fn has_block(&self, id: &str) -> bool {
        self.inner.tree.read().unwrap().nodes.contains_key(id)
    }

    /// Ordered child ids of a block.
    pub fn children(&self, id: &str) -> Result<Vec<String>> {
        let tree = self.inner.tree.read().unwrap();
        tree.nodes
            .get(id)
            .map(|node| node.children.clone())
            .ok_or_else(|| FolioError::BlockNotFound(id.to_string()))
    }

    /// Parent id of a block (`None` for the root).
    pub fn get_parent(&self, id: &str) -> Result<Option<String>> {
        let tree = self.inner.tree.read().unwrap();
        tree.nodes
            .get(id)
            .map(|node| node.parent.clone())
            .ok_or_else(|| FolioError::BlockNotFound(id.to_string()))
    }

    /// Id of the page's root block, if one exists.
    pub fn root(&self) -> Option<String> {
        self.inner.tree.read().unwrap().root.clone()
    }

    /// Number of blocks in the page.
    pub fn block_count(&self) -> usize {
        self.inner.tree.read().unwrap().nodes.len()
    }

    /// All block ids, root-first depth-first.
    pub fn block_ids(&self) -> Vec<String> {
        self.inner.tree.read().unwrap().dfs_order()
    }

    /// Extract a block's searchable content and references outside the
    /// event path, used for index rebuilds.
    pub(crate) fn record_of(&self, id: &str) -> Option<BlockRecord> {
        let txn = self.inner.doc.transact();
        self.inner.read_record(&txn, id)
    }

    // ==================== Rich Text ====================

    /// The `text` property of a block as a delta, or `None` if the block
    /// has no rich text.
    pub fn text_delta(&self, id: &str) -> Result<Option<TextDelta>> {
        let txn = self.inner.doc.transact();
        let block = self
            .inner
            .block_map(&txn, id)
            .ok_or_else(|| FolioError::BlockNotFound(id.to_string()))?;
        match block.get(&txn, &format!("{PROP_PREFIX}{TEXT_PROP}")) {
            Some(Out::YText(text)) => Ok(Some(read_text_delta(&txn, &text))),
            _ => Ok(None),
        }
    }

    /// Insert characters into a block's text at a byte offset.
    pub fn insert_text(&self, id: &str, index: u32, content: &str) -> Result<()> {
        self.ensure_loaded()?;
        let mut txn = self.inner.doc.transact_mut();
        let text = self.inner.text_of(&txn, id)?;
        text.insert(&mut txn, index, content);
        Ok(())
    }

    /// Remove a byte range from a block's text.
    pub fn remove_text(&self, id: &str, index: u32, len: u32) -> Result<()> {
        self.ensure_loaded()?;
        let mut txn = self.inner.doc.transact_mut();
        let text = self.inner.text_of(&txn, id)?;
        text.remove_range(&mut txn, index, len);
        Ok(())
    }

    /// Length of a block's text in bytes.
    pub fn text_len(&self, id: &str) -> Result<u32> {
        let txn = self.inner.doc.transact();
        let text = self.inner.text_of(&txn, id)?;
        Ok(text.len(&txn))
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for a sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.inner.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full document state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.inner.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode only the updates a remote peer is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| FolioError::Crdt(format!("Failed to decode state vector: {e}")))?;
        let txn = self.inner.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply a binary update from a peer or snapshot.
    ///
    /// Fires the same block events a local mutation would.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| FolioError::Crdt(format!("Failed to decode update: {e}")))?;
        let mut txn = self.inner.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| FolioError::Crdt(format!("Failed to apply update: {e}")))?;
        Ok(())
    }

    // ==================== Observers ====================

    /// Subscribe to block changes.
    ///
    /// The callback runs synchronously while the triggering transaction is
    /// being committed; it must not start new transactions on this page.
    /// Dropping the returned handle unsubscribes.
    pub fn subscribe(
        &self,
        listener: impl Fn(&BlockChange) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.inner.subscribers.subscribe(Arc::new(listener))
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("block_count", &self.block_count())
            .finish()
    }
}

impl PageInner {
    fn block_map<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<MapRef> {
        match self.blocks.get(txn, id) {
            Some(Out::YMap(map)) => Some(map),
            _ => None,
        }
    }

    fn children_array<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<ArrayRef> {
        match self.block_map(txn, id)?.get(txn, SYS_CHILDREN) {
            Some(Out::YArray(array)) => Some(array),
            _ => None,
        }
    }

    fn text_of<T: ReadTxn>(&self, txn: &T, id: &str) -> Result<TextRef> {
        let block = self
            .block_map(txn, id)
            .ok_or_else(|| FolioError::BlockNotFound(id.to_string()))?;
        match block.get(txn, &format!("{PROP_PREFIX}{TEXT_PROP}")) {
            Some(Out::YText(text)) => Ok(text),
            _ => Err(FolioError::SchemaViolation(format!(
                "block '{id}' has no text content"
            ))),
        }
    }

    /// Rebuild the model cache from the document.
    fn build_cache<T: ReadTxn>(&self, txn: &T) -> TreeCache {
        let mut cache = TreeCache::default();
        for (id, value) in self.blocks.iter(txn) {
            let Out::YMap(block) = value else { continue };
            let flavour = read_string(txn, &block, SYS_FLAVOUR).unwrap_or_default();
            let children = read_children(txn, &block);
            cache.nodes.insert(
                id.to_string(),
                TreeNode {
                    flavour,
                    parent: None,
                    children,
                },
            );
        }
        let links: Vec<(String, String)> = cache
            .nodes
            .iter()
            .flat_map(|(id, node)| {
                node.children
                    .iter()
                    .map(move |child| (child.clone(), id.clone()))
            })
            .collect();
        for (child, parent) in links {
            if let Some(node) = cache.nodes.get_mut(&child) {
                node.parent = Some(parent);
            }
        }
        cache.root = self.find_root(&cache);
        cache
    }

    fn find_root(&self, cache: &TreeCache) -> Option<String> {
        let mut roots: Vec<&String> = cache
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.parent.is_none()
                    && self
                        .schema
                        .get(&node.flavour)
                        .is_some_and(|s| s.role == BlockRole::Root)
            })
            .map(|(id, _)| id)
            .collect();
        roots.sort();
        roots.first().map(|id| (*id).clone())
    }

    /// Extract a block's searchable content and references.
    fn read_record<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<BlockRecord> {
        let block = self.block_map(txn, id)?;
        let flavour = read_string(txn, &block, SYS_FLAVOUR).unwrap_or_default();

        let mut props: Vec<(String, Out)> = block
            .iter(txn)
            .filter(|(key, _)| key.starts_with(PROP_PREFIX))
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        props.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut text_parts: Vec<String> = Vec::new();
        let mut references: Vec<RefTarget> = Vec::new();
        for (_, value) in props {
            match value {
                Out::YText(text) => {
                    text_parts.push(text.get_string(txn));
                    collect_delta_refs(&read_text_delta(txn, &text), &mut references);
                }
                Out::Any(any) => {
                    if let Any::String(s) = &any {
                        text_parts.push(s.to_string());
                    }
                    collect_any_refs(&any, &mut references);
                }
                _ => {}
            }
        }
        references.sort();
        references.dedup();

        Some(BlockRecord {
            id: id.to_string(),
            flavour,
            text: text_parts.join(" "),
            references,
        })
    }

    /// Translate one committed transaction into ordered block events.
    fn process_events(&self, txn: &TransactionMut, events: &Events) {
        if *self.state.read().unwrap() != PageState::Loaded {
            return;
        }

        let mut added: BTreeSet<String> = BTreeSet::new();
        let mut removed: BTreeSet<String> = BTreeSet::new();
        let mut updated: BTreeSet<String> = BTreeSet::new();
        let mut child_deltas: Vec<(String, Vec<ChildOp>)> = Vec::new();

        for event in events.iter() {
            match event {
                Event::Map(map_event) => {
                    let path: Vec<PathSegment> = map_event.path().into_iter().collect();
                    if path.is_empty() {
                        for (key, change) in map_event.keys(txn).iter() {
                            match change {
                                EntryChange::Inserted(_) => {
                                    added.insert(key.to_string());
                                }
                                EntryChange::Removed(_) => {
                                    removed.insert(key.to_string());
                                }
                                EntryChange::Updated(_, _) => {
                                    updated.insert(key.to_string());
                                }
                            }
                        }
                    } else if let Some(PathSegment::Key(id)) = path.first() {
                        updated.insert(id.to_string());
                    }
                }
                Event::Array(array_event) => {
                    let path: Vec<PathSegment> = array_event.path().into_iter().collect();
                    if path.len() == 2
                        && let (Some(PathSegment::Key(id)), Some(PathSegment::Key(field))) =
                            (path.first(), path.get(1))
                        && field.as_ref() == SYS_CHILDREN
                    {
                        let ops: Vec<ChildOp> = array_event
                            .delta(txn)
                            .iter()
                            .map(|change| match change {
                                Change::Retain(n) => ChildOp::Retain(*n as usize),
                                Change::Removed(n) => ChildOp::Remove(*n as usize),
                                Change::Added(items) => ChildOp::Insert(
                                    items
                                        .iter()
                                        .filter_map(|item| match item {
                                            Out::Any(Any::String(s)) => Some(s.to_string()),
                                            _ => None,
                                        })
                                        .collect(),
                                ),
                            })
                            .collect();
                        child_deltas.push((id.to_string(), ops));
                    } else if let Some(PathSegment::Key(id)) = path.first() {
                        updated.insert(id.to_string());
                    }
                }
                Event::Text(text_event) => {
                    let path: Vec<PathSegment> = text_event.path().into_iter().collect();
                    if let Some(PathSegment::Key(id)) = path.first() {
                        updated.insert(id.to_string());
                    }
                }
                _ => {}
            }
        }

        if added.is_empty() && removed.is_empty() && updated.is_empty() && child_deltas.is_empty()
        {
            return;
        }

        let mut changes: Vec<BlockChange> = Vec::new();
        {
            let mut tree = self.tree.write().unwrap();

            // Removals, ordered children-before-parents using the
            // pre-removal topology.
            let mut removal_order: Vec<(usize, String)> = removed
                .iter()
                .map(|id| (tree.depth(id), id.clone()))
                .collect();
            removal_order.sort_by(|(da, ia), (db, ib)| db.cmp(da).then(ia.cmp(ib)));
            for (_, id) in &removal_order {
                let flavour = tree
                    .nodes
                    .get(id)
                    .map(|node| node.flavour.clone())
                    .unwrap_or_default();
                changes.push(BlockChange::Removed {
                    id: id.clone(),
                    flavour,
                });
            }

            // Child-array deltas: update cached child order and parent
            // pointers of surviving blocks.
            let mut structural_parents: BTreeSet<String> = BTreeSet::new();
            let mut adopted: Vec<(String, String)> = Vec::new();
            for (parent_id, ops) in &child_deltas {
                if removed.contains(parent_id) {
                    continue;
                }
                structural_parents.insert(parent_id.clone());
                if let Some(node) = tree.nodes.get_mut(parent_id) {
                    let mut pos = 0usize;
                    for op in ops {
                        match op {
                            ChildOp::Retain(n) => pos += n,
                            ChildOp::Remove(n) => {
                                let end = (pos + n).min(node.children.len());
                                node.children.drain(pos..end);
                            }
                            ChildOp::Insert(ids) => {
                                for (offset, child) in ids.iter().enumerate() {
                                    let at = (pos + offset).min(node.children.len());
                                    node.children.insert(at, child.clone());
                                    adopted.push((child.clone(), parent_id.clone()));
                                }
                                pos += ids.len();
                            }
                        }
                    }
                }
            }

            // New blocks: read flavour/children from the document and link
            // parents (from adoption deltas or prefilled child lists).
            for id in &added {
                removed.remove(id);
                let Some(block) = self.block_map(txn, id) else {
                    continue;
                };
                let flavour = read_string(txn, &block, SYS_FLAVOUR).unwrap_or_default();
                let children = read_children(txn, &block);
                tree.nodes.insert(
                    id.clone(),
                    TreeNode {
                        flavour,
                        parent: None,
                        children,
                    },
                );
            }
            for id in &added {
                let children = tree
                    .nodes
                    .get(id)
                    .map(|node| node.children.clone())
                    .unwrap_or_default();
                for child in children {
                    if let Some(node) = tree.nodes.get_mut(&child) {
                        node.parent = Some(id.clone());
                    }
                }
            }
            for (child, parent) in adopted {
                if let Some(node) = tree.nodes.get_mut(&child) {
                    node.parent = Some(parent);
                }
            }

            // Drop removed nodes after ordering was derived.
            for (_, id) in &removal_order {
                tree.nodes.remove(id);
            }
            tree.root = self.find_root(&tree);

            // Additions, parents-before-children.
            let mut addition_order: Vec<(usize, String)> = added
                .iter()
                .filter(|id| tree.nodes.contains_key(*id))
                .map(|id| (tree.depth(id), id.clone()))
                .collect();
            addition_order.sort_by(|(da, ia), (db, ib)| da.cmp(db).then(ia.cmp(ib)));
            for (_, id) in &addition_order {
                if let Some(record) = self.read_record(txn, id) {
                    changes.push(BlockChange::Added(record));
                }
            }

            // Updates: touched props/text plus structural parents, minus
            // blocks already reported above.
            updated.extend(structural_parents);
            for id in &updated {
                if added.contains(id) || removed.contains(id) || !tree.nodes.contains_key(id) {
                    continue;
                }
                if let Some(record) = self.read_record(txn, id) {
                    changes.push(BlockChange::Updated(record));
                }
            }
        }

        for change in &changes {
            self.subscribers.emit(change);
        }
    }
}

// ===========================================================================
// Property plumbing
// ===========================================================================

fn write_prop(txn: &mut TransactionMut, block: &MapRef, key: &str, value: &PropValue) {
    let prop_key = format!("{PROP_PREFIX}{key}");
    match value {
        PropValue::Text(delta) => {
            let text = block.insert(txn, prop_key.as_str(), TextPrelim::new(""));
            apply_delta(txn, &text, delta);
        }
        other => {
            block.insert(txn, prop_key.as_str(), types::prop_to_any(other));
        }
    }
}

fn apply_delta(txn: &mut TransactionMut, text: &TextRef, delta: &TextDelta) {
    let mut index = text.len(txn);
    for span in &delta.0 {
        match &span.attributes {
            Some(attrs) => {
                let attrs: yrs::types::Attrs = attrs
                    .iter()
                    .map(|(k, v)| (Arc::from(k.as_str()), types::json_to_any(v)))
                    .collect();
                text.insert_with_attributes(txn, index, &span.insert, attrs);
            }
            None => text.insert(txn, index, &span.insert),
        }
        index += span.insert.len() as u32;
    }
}

fn read_prop<T: ReadTxn>(txn: &T, value: &Out) -> PropValue {
    match value {
        Out::Any(any) => types::any_to_prop(any),
        Out::YText(text) => PropValue::Text(read_text_delta(txn, text)),
        _ => PropValue::Null,
    }
}

fn read_text_delta<T: ReadTxn>(txn: &T, text: &TextRef) -> TextDelta {
    let spans = text
        .diff(txn, YChange::identity)
        .into_iter()
        .filter_map(|diff| {
            let insert = match &diff.insert {
                Out::Any(Any::String(s)) => s.to_string(),
                _ => return None,
            };
            let attributes = diff.attributes.as_ref().map(|attrs| {
                let mut entries: Vec<(String, serde_json::Value)> = attrs
                    .iter()
                    .map(|(k, v)| (k.to_string(), types::any_to_json(v)))
                    .collect();
                entries.sort_by(|(a, _), (b, _)| a.cmp(b));
                entries.into_iter().collect()
            });
            Some(TextSpan { insert, attributes })
        })
        .collect();
    TextDelta(spans)
}

fn read_string<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<String> {
    match map.get(txn, key) {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    }
}

fn read_children<T: ReadTxn>(txn: &T, block: &MapRef) -> Vec<String> {
    match block.get(txn, SYS_CHILDREN) {
        Some(Out::YArray(array)) => array
            .iter(txn)
            .filter_map(|value| match value {
                Out::Any(Any::String(s)) => Some(s.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn position_of<T: ReadTxn>(txn: &T, array: &ArrayRef, id: &str) -> Option<u32> {
    array
        .iter(txn)
        .position(|value| matches!(&value, Out::Any(Any::String(s)) if s.as_ref() == id))
        .map(|pos| pos as u32)
}

/// Collect reference targets from an `Any` tree: any map carrying a string
/// `pageId` counts, including reference marks inside nested delta
/// attributes.
fn collect_any_refs(value: &Any, out: &mut Vec<RefTarget>) {
    match value {
        Any::Map(entries) => {
            if let Some(target) = types::any_map_as_reference(entries) {
                out.push(target);
            }
            for value in entries.values() {
                collect_any_refs(value, out);
            }
        }
        Any::Array(items) => {
            for item in items.iter() {
                collect_any_refs(item, out);
            }
        }
        _ => {}
    }
}

fn collect_delta_refs(delta: &TextDelta, out: &mut Vec<RefTarget>) {
    for span in &delta.0 {
        let Some(attrs) = &span.attributes else { continue };
        for value in attrs.values() {
            collect_json_refs(value, out);
        }
    }
}

fn collect_json_refs(value: &serde_json::Value, out: &mut Vec<RefTarget>) {
    match value {
        serde_json::Value::Object(entries) => {
            if let Some(serde_json::Value::String(page_id)) = entries.get(types::REF_PAGE_KEY) {
                let block_id = match entries.get(types::REF_BLOCK_KEY) {
                    Some(serde_json::Value::String(s)) => Some(s.clone()),
                    _ => None,
                };
                out.push(RefTarget {
                    page_id: page_id.clone(),
                    block_id,
                });
            }
            for value in entries.values() {
                collect_json_refs(value, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_json_refs(item, out);
            }
        }
        _ => {}
    }
}
