//! Synchronization provider interface.
//!
//! A [`DocProvider`] is a pluggable channel that exchanges binary updates
//! for one document, either the workspace meta document or a single page. The
//! workspace registers and detaches providers but knows nothing about
//! transport framing: a provider receives the yrs [`Doc`] handle and wires
//! itself to the update stream (`observe_update_v1` outbound,
//! `apply_update` inbound).

use yrs::Doc;

/// A synchronization channel for one document.
pub trait DocProvider: Send + Sync {
    /// Begin exchanging updates.
    fn connect(&self);

    /// Stop exchanging updates. Called when the provider is unregistered
    /// or the owning document is disposed.
    fn disconnect(&self);

    /// Whether the channel is currently active.
    fn is_connected(&self) -> bool;
}

/// Factory producing a provider for a document.
///
/// Receives the document id and the live yrs document handle.
pub type DocProviderCreator<'a> = dyn Fn(&str, &Doc) -> Box<dyn DocProvider> + 'a;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use yrs::updates::decoder::Decode;
    use yrs::{Transact, Update};

    /// Shared pipe carrying raw updates between two test providers.
    #[derive(Default)]
    pub struct UpdatePipe {
        pub sent: Mutex<Vec<Vec<u8>>>,
    }

    /// Provider that records outbound updates into an [`UpdatePipe`] while
    /// connected.
    pub struct RecordingProvider {
        doc_id: String,
        connected: Arc<AtomicBool>,
        _update_sub: yrs::Subscription,
    }

    impl RecordingProvider {
        pub fn new(doc_id: &str, doc: &Doc, pipe: Arc<UpdatePipe>) -> Self {
            let connected = Arc::new(AtomicBool::new(false));
            let connected_clone = Arc::clone(&connected);
            let update_sub = doc
                .observe_update_v1(move |_txn, event| {
                    if connected_clone.load(Ordering::SeqCst) {
                        pipe.sent.lock().unwrap().push(event.update.clone());
                    }
                })
                .expect("Failed to observe document updates");
            Self {
                doc_id: doc_id.to_string(),
                connected,
                _update_sub: update_sub,
            }
        }

        pub fn doc_id(&self) -> &str {
            &self.doc_id
        }
    }

    impl DocProvider for RecordingProvider {
        fn connect(&self) {
            self.connected.store(true, Ordering::SeqCst);
        }

        fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    /// Drain a pipe into a document, simulating inbound delivery.
    pub fn deliver(pipe: &UpdatePipe, doc: &Doc) {
        let updates: Vec<Vec<u8>> = pipe.sent.lock().unwrap().drain(..).collect();
        for update in updates {
            if let Ok(decoded) = Update::decode_v1(&update) {
                let mut txn = doc.transact_mut();
                let _ = txn.apply_update(decoded);
            }
        }
    }
}
