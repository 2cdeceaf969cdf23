//! Versioned maps and the network object store built on them.

mod event;
mod network_store;
mod versioned;

pub use event::NetworkEvent;
pub use network_store::{NetworkObjectStore, StoreBackend, StoreDelegate};
pub use versioned::{
    ComputeFn, InMemoryVersionedStore, MapEvent, MapListener, Versioned, VersionedStore,
    put_if_absent, replace_existing,
};
