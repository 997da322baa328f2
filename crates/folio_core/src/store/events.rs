//! Block change events.
//!
//! A page dispatches a [`BlockChange`] for every block affected by a
//! committed transaction, whether the mutation originated locally or
//! arrived as a binary update from a provider. Subscribers (the indexer,
//! UI collaborators) cannot tell the two apart.
//!
//! Events are delivered synchronously, on the mutating thread, in a fixed
//! order per transaction: removals children-before-parents, then additions
//! parents-before-children, then updates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use super::types::RefTarget;

/// Content extracted from a block at event time.
///
/// Carrying the extracted text and references in the event (rather than
/// having subscribers read the document) keeps subscribers out of the
/// commit path: the document is mid-transaction while events fire.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    /// Block id.
    pub id: String,
    /// Block flavour.
    pub flavour: String,
    /// Concatenated searchable text: rich-text props and plain string
    /// props, in property order.
    pub text: String,
    /// Page/block references found in props and text attributes.
    pub references: Vec<RefTarget>,
}

/// A change to a single block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockChange {
    /// Block inserted into the tree.
    Added(BlockRecord),
    /// Block props, text or children changed.
    Updated(BlockRecord),
    /// Block removed from the tree.
    Removed {
        /// Id of the removed block.
        id: String,
        /// Flavour it had before removal.
        flavour: String,
    },
}

impl BlockChange {
    /// Id of the affected block.
    pub fn block_id(&self) -> &str {
        match self {
            BlockChange::Added(record) | BlockChange::Updated(record) => &record.id,
            BlockChange::Removed { id, .. } => id,
        }
    }
}

type Listener = Arc<dyn Fn(&BlockChange) + Send + Sync>;

/// Subscriber list shared between a page and its event subscriptions.
#[derive(Default)]
pub(crate) struct Subscribers {
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl Subscribers {
    pub(crate) fn subscribe(self: &Arc<Self>, listener: Listener) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().unwrap().push((id, listener));
        EventSubscription {
            subscribers: Arc::downgrade(self),
            id,
        }
    }

    pub(crate) fn emit(&self, change: &BlockChange) {
        let listeners = self.listeners.read().unwrap().clone();
        for (_, listener) in listeners {
            listener(change);
        }
    }

    pub(crate) fn detach(&self, id: u64) {
        self.listeners.write().unwrap().retain(|(lid, _)| *lid != id);
    }

    pub(crate) fn clear(&self) {
        self.listeners.write().unwrap().clear();
    }
}

/// Handle to a block-event subscription. Dropping it unsubscribes.
pub struct EventSubscription {
    subscribers: Weak<Subscribers>,
    id: u64,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.detach(self.id);
        }
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn removed(id: &str) -> BlockChange {
        BlockChange::Removed {
            id: id.to_string(),
            flavour: "folio:paragraph".to_string(),
        }
    }

    #[test]
    fn test_emit_reaches_subscriber() {
        let subscribers = Arc::new(Subscribers::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = subscribers.subscribe(Arc::new(move |change: &BlockChange| {
            seen_clone.lock().unwrap().push(change.block_id().to_string());
        }));

        subscribers.emit(&removed("a"));
        subscribers.emit(&removed("b"));

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let subscribers = Arc::new(Subscribers::default());
        let seen = Arc::new(Mutex::new(0usize));
        let seen_clone = Arc::clone(&seen);

        let sub = subscribers.subscribe(Arc::new(move |_| {
            *seen_clone.lock().unwrap() += 1;
        }));

        subscribers.emit(&removed("a"));
        drop(sub);
        subscribers.emit(&removed("b"));

        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
