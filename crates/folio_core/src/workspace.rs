//! Workspace aggregate.
//!
//! A [`Workspace`] owns the meta document, the set of page stores, the blob
//! manager, the indexer and the provider registry. Page stores are
//! constructed and torn down from meta-map events only: local
//! `create_page`/`remove_page` and entries replicated from a peer flow
//! through the same observer, so a page arriving over sync behaves exactly
//! like one created locally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::blob::{BlobManager, BlobStorage};
use crate::error::{FolioError, Result};
use crate::indexer::{Indexer, SearchResult};
use crate::meta::{PageMeta, PageMetaPatch, WorkspaceMeta};
use crate::provider::{DocProvider, DocProviderCreator};
use crate::schema::Schema;
use crate::snapshot::{self, PageSnapshot};
use crate::store::{
    BlockChange, EventSubscription, IdGenerator, Page, PageState, UuidGenerator,
};

/// Construction options for a workspace.
pub struct WorkspaceOptions {
    /// Workspace id; doubles as the meta document id for providers.
    pub id: String,
    /// Block flavour registry shared by all pages.
    pub schema: Schema,
    /// Blob storage backends; defaults to a single in-memory backend.
    pub blob_backends: Vec<Arc<dyn BlobStorage>>,
    /// Id generator for pages and blocks; defaults to random UUIDs.
    pub id_generator: Option<Arc<dyn IdGenerator>>,
}

impl WorkspaceOptions {
    /// Options with the given id and schema, defaults elsewhere.
    pub fn new(id: impl Into<String>, schema: Schema) -> Self {
        Self {
            id: id.into(),
            schema,
            blob_backends: Vec::new(),
            id_generator: None,
        }
    }

    /// Add a blob storage backend.
    pub fn with_blob_backend(mut self, backend: Arc<dyn BlobStorage>) -> Self {
        self.blob_backends.push(backend);
        self
    }

    /// Use a specific id generator.
    pub fn with_id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }
}

/// Workspace-level lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceEvent {
    /// A page store was constructed (locally or from a replicated meta).
    PageAdded(String),
    /// A page store was disposed.
    PageRemoved(String),
}

struct PageEntry {
    page: Page,
    _indexer_sub: EventSubscription,
}

type WorkspaceListener = Arc<dyn Fn(&WorkspaceEvent) + Send + Sync>;

/// Top-level aggregate owning pages, metadata, blobs, indexes and
/// providers.
#[derive(Clone)]
pub struct Workspace {
    inner: Arc<WorkspaceInner>,
}

struct WorkspaceInner {
    id: String,
    meta: WorkspaceMeta,
    schema: Arc<Schema>,
    id_gen: Arc<dyn IdGenerator>,
    blobs: Arc<BlobManager>,
    indexer: Arc<Indexer>,
    pages: RwLock<HashMap<String, PageEntry>>,
    providers: RwLock<HashMap<String, Vec<Box<dyn DocProvider>>>>,
    listeners: RwLock<Vec<(u64, WorkspaceListener)>>,
    next_listener_id: AtomicU64,
    meta_sub: Mutex<Option<yrs::Subscription>>,
}

impl Workspace {
    /// Build a workspace and bind its meta-event subscriptions.
    pub fn new(options: WorkspaceOptions) -> Self {
        let inner = Arc::new(WorkspaceInner {
            id: options.id,
            meta: WorkspaceMeta::new(),
            schema: Arc::new(options.schema),
            id_gen: options
                .id_generator
                .unwrap_or_else(|| Arc::new(UuidGenerator)),
            blobs: Arc::new(BlobManager::new(options.blob_backends)),
            indexer: Arc::new(Indexer::new()),
            pages: RwLock::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            meta_sub: Mutex::new(None),
        });

        let weak: Weak<WorkspaceInner> = Arc::downgrade(&inner);
        let sub = inner.meta.observe_pages(move |changes| {
            let Some(inner) = weak.upgrade() else { return };
            for (page_id, meta) in changes {
                match meta {
                    Some(_) => inner.handle_page_added(&page_id),
                    None => inner.handle_page_removed(&page_id),
                }
            }
        });
        *inner.meta_sub.lock().unwrap() = Some(sub);

        Self { inner }
    }

    /// Workspace id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The workspace meta document.
    pub fn meta(&self) -> &WorkspaceMeta {
        &self.inner.meta
    }

    /// The content-addressed blob storage.
    pub fn blobs(&self) -> &Arc<BlobManager> {
        &self.inner.blobs
    }

    /// The search/backlink indexer.
    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.inner.indexer
    }

    /// The shared schema registry.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    // ==================== Page Lifecycle ====================

    /// Create a page and return its loaded store.
    ///
    /// Fails with [`FolioError::PageAlreadyExists`] when the id is taken.
    /// Passing `None` allocates an id from the workspace generator.
    pub fn create_page(&self, id: Option<&str>) -> Result<Page> {
        let page_id = match id {
            Some(id) => id.to_string(),
            None => self.inner.id_gen.next_id(),
        };
        if self.inner.meta.has_page(&page_id) {
            return Err(FolioError::PageAlreadyExists(page_id));
        }

        // The meta observer constructs the store synchronously.
        self.inner.meta.add_page_meta(PageMeta::new(page_id.clone()));

        let page = self
            .page(&page_id)
            .ok_or_else(|| FolioError::PageNotFound(page_id.clone()))?;
        page.load()?;
        Ok(page)
    }

    /// Dispose a page store, evict its index entries and remove its meta.
    pub fn remove_page(&self, page_id: &str) -> Result<()> {
        if !self.inner.meta.has_page(page_id) {
            return Err(FolioError::PageNotFound(page_id.to_string()));
        }
        // Teardown runs in the meta observer, shared with remote removals.
        self.inner.meta.remove_page_meta(page_id);
        Ok(())
    }

    /// Look up a page store.
    pub fn page(&self, page_id: &str) -> Option<Page> {
        self.inner
            .pages
            .read()
            .unwrap()
            .get(page_id)
            .map(|entry| entry.page.clone())
    }

    /// All page metas, ordered by creation time.
    pub fn page_metas(&self) -> Vec<PageMeta> {
        self.inner.meta.page_metas()
    }

    /// Patch a page's metadata (title, tags, hidden flag).
    pub fn set_page_meta(&self, page_id: &str, patch: PageMetaPatch) -> Result<()> {
        self.inner.meta.set_page_meta(page_id, patch)
    }

    // ==================== Search ====================

    /// Query the search index.
    pub fn search(&self, query: &str) -> Vec<SearchResult> {
        self.inner.indexer.search(query)
    }

    /// Rebuild both indexes from a full scan of every loaded page.
    ///
    /// The result is identical to the incrementally maintained state; this
    /// is the recovery path after index corruption.
    pub fn reindex(&self) {
        self.inner.indexer.clear();
        let pages: Vec<Page> = {
            let pages = self.inner.pages.read().unwrap();
            let mut pages: Vec<Page> =
                pages.values().map(|entry| entry.page.clone()).collect();
            pages.sort_by(|a, b| a.id().cmp(b.id()));
            pages
        };
        for page in pages {
            if page.state() != PageState::Loaded {
                continue;
            }
            for block_id in page.block_ids() {
                if let Some(record) = page.record_of(&block_id) {
                    self.inner
                        .indexer
                        .apply(page.id(), &BlockChange::Added(record));
                }
            }
        }
    }

    // ==================== Snapshots ====================

    /// Export a page as a structural JSON snapshot.
    pub fn export_page_snapshot(&self, page_id: &str) -> Result<PageSnapshot> {
        let page = self
            .page(page_id)
            .ok_or_else(|| FolioError::PageNotFound(page_id.to_string()))?;
        if page.state() != PageState::Loaded {
            return Err(FolioError::PageNotLoaded(page_id.to_string()));
        }
        snapshot::export_page(&page)
    }

    /// Export a page's full binary state for exact-fidelity interchange.
    pub fn export_page_update(&self, page_id: &str) -> Result<Vec<u8>> {
        let page = self
            .page(page_id)
            .ok_or_else(|| FolioError::PageNotFound(page_id.to_string()))?;
        Ok(page.encode_state_as_update())
    }

    /// Import a structural JSON snapshot into a page.
    ///
    /// An existing page is cleared first; otherwise the page is created.
    /// Import is best-effort, not transactional: a failure part-way leaves
    /// the page cleared (or partially populated) rather than restoring its
    /// previous content.
    pub async fn import_page_snapshot(
        &self,
        snapshot: &PageSnapshot,
        page_id: &str,
    ) -> Result<()> {
        let page = self.clear_or_create_page(page_id)?;
        snapshot::import_into(&page, snapshot, &self.inner.schema, &self.inner.blobs).await
    }

    /// Import a binary state capture into a page, clearing or creating it
    /// first.
    pub fn import_page_update(&self, update: &[u8], page_id: &str) -> Result<()> {
        let page = self.clear_or_create_page(page_id)?;
        page.apply_update(update)
    }

    fn clear_or_create_page(&self, page_id: &str) -> Result<Page> {
        match self.page(page_id) {
            Some(page) => {
                page.load()?;
                page.clear()?;
                Ok(page)
            }
            None => self.create_page(Some(page_id)),
        }
    }

    // ==================== Providers ====================

    /// Attach a synchronization provider.
    ///
    /// With `doc_id` of `None` the provider is attached to the workspace
    /// meta document; otherwise to the given page's document. The provider
    /// is connected immediately and disconnected when unregistered or when
    /// the page is disposed.
    pub fn register_provider(
        &self,
        creator: &DocProviderCreator<'_>,
        doc_id: Option<&str>,
    ) -> Result<()> {
        let (key, provider) = match doc_id {
            None => {
                let provider = creator(&self.inner.id, self.inner.meta.doc());
                (self.inner.id.clone(), provider)
            }
            Some(page_id) => {
                let page = self
                    .page(page_id)
                    .ok_or_else(|| FolioError::PageNotFound(page_id.to_string()))?;
                let provider = creator(page_id, page.doc());
                (page_id.to_string(), provider)
            }
        };
        provider.connect();
        self.inner
            .providers
            .write()
            .unwrap()
            .entry(key)
            .or_default()
            .push(provider);
        Ok(())
    }

    /// Disconnect and drop all providers for a document (`None` for the
    /// meta document).
    pub fn unregister_providers(&self, doc_id: Option<&str>) {
        let key = doc_id.unwrap_or(&self.inner.id);
        self.inner.detach_providers(key);
    }

    /// Number of providers attached to a document.
    pub fn provider_count(&self, doc_id: Option<&str>) -> usize {
        let key = doc_id.unwrap_or(&self.inner.id);
        self.inner
            .providers
            .read()
            .unwrap()
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    // ==================== Events ====================

    /// Subscribe to page lifecycle events. Returns an opaque token for
    /// [`Workspace::unsubscribe`].
    pub fn subscribe(
        &self,
        listener: impl Fn(&WorkspaceEvent) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .unwrap()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener registered with [`Workspace::subscribe`].
    pub fn unsubscribe(&self, token: u64) {
        self.inner
            .listeners
            .write()
            .unwrap()
            .retain(|(id, _)| *id != token);
    }

    // ==================== Teardown ====================

    /// Tear the workspace down: dispose every page, disconnect every
    /// provider and detach the meta subscription. Idempotent.
    pub fn dispose(&self) {
        *self.inner.meta_sub.lock().unwrap() = None;
        let entries: Vec<(String, PageEntry)> =
            self.inner.pages.write().unwrap().drain().collect();
        for (page_id, entry) in entries {
            entry.page.dispose();
            self.inner.detach_providers(&page_id);
        }
        self.inner.detach_providers(&self.inner.id);
        self.inner.listeners.write().unwrap().clear();
    }
}

impl WorkspaceInner {
    fn handle_page_added(&self, page_id: &str) {
        {
            let pages = self.pages.read().unwrap();
            if pages.contains_key(page_id) {
                // meta update for an existing page, nothing to construct
                return;
            }
        }

        let page = Page::new(
            page_id,
            Arc::clone(&self.schema),
            Arc::clone(&self.id_gen),
        );
        let indexer = Arc::clone(&self.indexer);
        let indexed_page = page_id.to_string();
        let indexer_sub = page.subscribe(move |change| {
            indexer.apply(&indexed_page, change);
        });

        self.pages.write().unwrap().insert(
            page_id.to_string(),
            PageEntry {
                page,
                _indexer_sub: indexer_sub,
            },
        );
        self.emit(&WorkspaceEvent::PageAdded(page_id.to_string()));
    }

    fn handle_page_removed(&self, page_id: &str) {
        let entry = self.pages.write().unwrap().remove(page_id);
        let Some(entry) = entry else { return };

        entry.page.dispose();
        self.detach_providers(page_id);
        self.indexer.remove_page(page_id);
        self.emit(&WorkspaceEvent::PageRemoved(page_id.to_string()));
    }

    fn detach_providers(&self, key: &str) {
        let providers = self.providers.write().unwrap().remove(key);
        if let Some(providers) = providers {
            for provider in &providers {
                provider.disconnect();
            }
        }
    }

    fn emit(&self, event: &WorkspaceEvent) {
        let listeners = self.listeners.read().unwrap().clone();
        for (_, listener) in listeners {
            listener(event);
        }
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.inner.id)
            .field("page_count", &self.inner.meta.page_count())
            .finish()
    }
}
