//! Versioned key-value map contract and an in-memory implementation.
//!
//! The contract mirrors a replicated consistent map: every write bumps a
//! version, writes to one key are totally ordered, and listeners observe
//! INSERT/UPDATE/REMOVE with the old and new versioned values.

use crate::error::{Result, StoreError};
use crate::listener::{ListenerId, ListenerRegistry};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A value together with the version at which it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<V> {
    pub value: V,
    pub version: u64,
}

/// Change notification from a versioned map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEvent<K, V> {
    Insert {
        key: K,
        new: Versioned<V>,
    },
    Update {
        key: K,
        old: Versioned<V>,
        new: Versioned<V>,
    },
    Remove {
        key: K,
        old: Versioned<V>,
    },
}

impl<K, V> MapEvent<K, V> {
    pub fn key(&self) -> &K {
        match self {
            MapEvent::Insert { key, .. }
            | MapEvent::Update { key, .. }
            | MapEvent::Remove { key, .. } => key,
        }
    }
}

/// Receives map change notifications.
///
/// Called synchronously while the map holds its write lock, so a listener
/// must not call back into the same map. Hand the event off instead.
pub trait MapListener<K, V>: Send + Sync {
    fn event(&self, event: &MapEvent<K, V>);
}

/// Compute callback: receives the key and current value, returns the new value
/// or an error that aborts the whole operation.
pub type ComputeFn<'a, K, V> = dyn FnMut(&K, Option<&V>) -> Result<V> + 'a;

/// Distributed map contract consumed by the store and the port allocator.
pub trait VersionedStore<K, V>: Send + Sync {
    /// Atomically read-compare-write one key. Nothing is written if `f` fails.
    fn compute(&self, key: &K, f: &mut ComputeFn<'_, K, V>) -> Result<Versioned<V>>;

    fn get(&self, key: &K) -> Option<Versioned<V>>;

    /// Remove a key, returning the prior value. Removing an absent key is a no-op.
    fn remove(&self, key: &K) -> Option<Versioned<V>>;

    fn values(&self) -> Vec<Versioned<V>>;

    fn keys(&self) -> Vec<K>;

    fn entries(&self) -> Vec<(K, Versioned<V>)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Any one key, without copying the whole key set when the backend can avoid it.
    fn any_key(&self) -> Option<K> {
        self.keys().into_iter().next()
    }

    fn add_listener(&self, listener: Arc<dyn MapListener<K, V>>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Single-process [`VersionedStore`] backed by a locked `HashMap`.
pub struct InMemoryVersionedStore<K, V> {
    entries: RwLock<HashMap<K, Versioned<V>>>,
    version: AtomicU64,
    listeners: ListenerRegistry<dyn MapListener<K, V>>,
}

impl<K, V> InMemoryVersionedStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        InMemoryVersionedStore {
            entries: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Shared handle typed as the trait object the store consumes.
    pub fn shared() -> Arc<dyn VersionedStore<K, V>> {
        Arc::new(Self::new())
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, event: MapEvent<K, V>) {
        self.listeners.broadcast(|l| l.event(&event));
    }
}

impl<K, V> Default for InMemoryVersionedStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> VersionedStore<K, V> for InMemoryVersionedStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn compute(&self, key: &K, f: &mut ComputeFn<'_, K, V>) -> Result<Versioned<V>> {
        let mut entries = self.entries.write().unwrap();
        let existing = entries.get(key).cloned();
        let value = f(key, existing.as_ref().map(|v| &v.value))?;
        let new = Versioned {
            value,
            version: self.next_version(),
        };
        entries.insert(key.clone(), new.clone());

        // Notify under the lock so per-key event order matches write order.
        let event = match existing {
            Some(old) => MapEvent::Update {
                key: key.clone(),
                old,
                new: new.clone(),
            },
            None => MapEvent::Insert {
                key: key.clone(),
                new: new.clone(),
            },
        };
        self.notify(event);
        Ok(new)
    }

    fn get(&self, key: &K) -> Option<Versioned<V>> {
        self.entries.read().unwrap().get(key).cloned()
    }

    fn remove(&self, key: &K) -> Option<Versioned<V>> {
        let mut entries = self.entries.write().unwrap();
        let old = entries.remove(key)?;
        self.notify(MapEvent::Remove {
            key: key.clone(),
            old: old.clone(),
        });
        Some(old)
    }

    fn values(&self) -> Vec<Versioned<V>> {
        self.entries.read().unwrap().values().cloned().collect()
    }

    fn keys(&self) -> Vec<K> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    fn entries(&self) -> Vec<(K, Versioned<V>)> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    fn any_key(&self) -> Option<K> {
        self.entries.read().unwrap().keys().next().cloned()
    }

    fn add_listener(&self, listener: Arc<dyn MapListener<K, V>>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

/// Insert `value` unless the key exists.
pub fn put_if_absent<K, V: Clone>(
    store: &dyn VersionedStore<K, V>,
    key: &K,
    value: V,
    kind: &'static str,
    id: &str,
) -> Result<Versioned<V>> {
    store.compute(key, &mut |_, existing| match existing {
        Some(_) => Err(StoreError::already_exists(kind, id)),
        None => Ok(value.clone()),
    })
}

/// Replace the value of an existing key.
pub fn replace_existing<K, V: Clone>(
    store: &dyn VersionedStore<K, V>,
    key: &K,
    value: V,
    kind: &'static str,
    id: &str,
) -> Result<Versioned<V>> {
    store.compute(key, &mut |_, existing| match existing {
        Some(_) => Ok(value.clone()),
        None => Err(StoreError::not_found(kind, id)),
    })
}
