// Observer registry: handle-keyed callback lists
//
// Unsubscribe removes by handle, never by comparing callbacks, so the same
// closure registered twice yields two independent subscriptions.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle returned by every `subscribe`/`on_*` call.
///
/// Handles are unique process-wide, so one owner can keep several
/// registries and route `unsubscribe` to whichever holds the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Ordered list of observers of type `T` (usually `dyn Fn(..) + Send + Sync`)
pub struct Observers<T: ?Sized> {
    entries: RwLock<Vec<(SubscriptionId, Arc<T>)>>,
}

impl<T: ?Sized> Observers<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<T>) -> SubscriptionId {
        let id = SubscriptionId(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, observer));
        id
    }

    /// Returns false if the handle was unknown or already removed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Copy of the current observers.
    ///
    /// Callers notify from the snapshot so observers may (un)subscribe
    /// re-entrantly without deadlocking.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl<T: ?Sized> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}
