//! Owned listener registries.
//!
//! Registration is rare and delivery is hot, so the listener list is an
//! immutable snapshot swapped on change (lock-free reads via ArcSwap).

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Entries<L> = Vec<(ListenerId, Arc<L>)>;

/// A list of listeners delivered to in registration order.
pub struct ListenerRegistry<L: ?Sized> {
    next_id: AtomicU64,
    entries: ArcSwap<Entries<L>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new() -> Self {
        ListenerRegistry {
            next_id: AtomicU64::new(1),
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Register a listener; it receives every subsequent broadcast.
    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.rcu(|current| {
            let mut next: Entries<L> = (**current).clone();
            next.push((id, Arc::clone(&listener)));
            next
        });
        id
    }

    /// Unregister a listener. Returns false if the id was unknown.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.entries.rcu(|current| {
            let next: Entries<L> = current
                .iter()
                .filter(|(entry_id, _)| *entry_id != id)
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    /// Deliver to every listener, in registration order, on the calling thread.
    pub fn broadcast(&self, mut deliver: impl FnMut(&L)) {
        let snapshot = self.entries.load();
        for (_, listener) in snapshot.iter() {
            deliver(listener);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    pub fn clear(&self) {
        self.entries.store(Arc::new(Vec::new()));
    }
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}
