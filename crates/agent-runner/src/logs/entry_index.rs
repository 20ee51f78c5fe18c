//! Entry index allocation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::msg_store::MsgStore;

/// Monotonic counter numbering normalized entries within one
/// normalization session. Clones share the counter.
#[derive(Debug, Clone, Default)]
pub struct EntryIndexProvider(Arc<AtomicUsize>);

impl EntryIndexProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after the highest entry already added to `msg_store`, so a
    /// resumed session never renumbers rendered entries
    pub fn start_from(msg_store: &MsgStore) -> Self {
        let start = msg_store.max_entry_index().map_or(0, |max| max + 1);
        Self(Arc::new(AtomicUsize::new(start)))
    }

    /// Return the current index and advance
    pub fn next(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}
