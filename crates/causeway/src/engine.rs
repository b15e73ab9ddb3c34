//! Flow engine bundle.

use std::sync::Arc;

use crate::manager::FlowManager;
use crate::notary::NotaryService;
use crate::store::Store;

/// Convenience bundle for a manager + uniqueness service pair.
pub struct Engine<S: Store> {
    pub manager: FlowManager<S>,
    pub notary: Arc<NotaryService>,
}

impl<S: Store> Engine<S> {
    /// Bundle a built manager with its uniqueness service handle.
    pub fn new(manager: FlowManager<S>) -> Self {
        let notary = Arc::clone(manager.notary());
        Self { manager, notary }
    }
}

impl<S: Store> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            notary: Arc::clone(&self.notary),
        }
    }
}
