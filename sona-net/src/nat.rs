//! SNAT transport port pool with time-bounded leases.
//!
//! Every port in `[min, max)` lives in exactly one of two maps: the free set
//! or the lease map (port -> lease timestamp in ms). Both maps may be shared
//! by several cluster members; a rare double allocation under a race is
//! tolerated.

use crate::error::StoreError;
use crate::store::{InMemoryVersionedStore, VersionedStore};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, trace, warn};

/// Source of "now" in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        ManualClock {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Allocates unique transport ports for NAT translation.
pub struct PortNumberAllocator {
    free: Arc<dyn VersionedStore<u16, ()>>,
    leases: Arc<dyn VersionedStore<u16, i64>>,
    clock: Arc<dyn Clock>,
    min: u16,
    max: u16,
    ttl_ms: i64,
}

impl PortNumberAllocator {
    /// Build on existing maps. Call [`initialize`](Self::initialize) once the
    /// maps are reachable to fill the free set.
    pub fn new(
        free: Arc<dyn VersionedStore<u16, ()>>,
        leases: Arc<dyn VersionedStore<u16, i64>>,
        clock: Arc<dyn Clock>,
        min: u16,
        max: u16,
        ttl_ms: u64,
    ) -> Self {
        PortNumberAllocator {
            free,
            leases,
            clock,
            min,
            max,
            ttl_ms: i64::try_from(ttl_ms).unwrap_or(i64::MAX),
        }
    }

    /// Private in-memory pool over `[min, max)`, already initialized.
    pub fn in_memory(min: u16, max: u16, ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        let allocator = Self::new(
            InMemoryVersionedStore::shared(),
            InMemoryVersionedStore::shared(),
            clock,
            min,
            max,
            ttl_ms,
        );
        allocator.initialize();
        allocator
    }

    /// Put every port of the range that is not leased into the free set, then
    /// reclaim expired leases.
    pub fn initialize(&self) {
        for port in self.min..self.max {
            if !self.leases.contains_key(&port) && !self.free.contains_key(&port) {
                mark_free(self.free.as_ref(), port);
            }
        }
        let reclaimed = self.reclaim_expired();
        debug!(
            min = self.min,
            max = self.max,
            free = self.free.len(),
            reclaimed,
            "SNAT port pool initialized"
        );
    }

    /// Lease a port. Reclaims expired leases first when the free set is empty.
    /// Returns `None` when the pool is exhausted.
    pub fn allocate(&self) -> Option<u16> {
        if self.free.is_empty() {
            self.reclaim_expired();
        }

        loop {
            let Some(port) = self.free.any_key() else {
                warn!("SNAT port pool exhausted");
                return None;
            };
            // Another member may have taken it between any_key and remove.
            if self.free.remove(&port).is_none() {
                trace!(port, "lost race for SNAT port, retrying");
                continue;
            }
            let now = self.clock.now_ms();
            if let Err(e) = self.leases.compute(&port, &mut |_, _| Ok(now)) {
                warn!(port, error = %e, "failed to record SNAT lease");
                mark_free(self.free.as_ref(), port);
                return None;
            }
            trace!(port, "SNAT port leased");
            return Some(port);
        }
    }

    /// Return a leased port to the free set early.
    pub fn release(&self, port: u16) -> bool {
        if self.leases.remove(&port).is_none() {
            return false;
        }
        mark_free(self.free.as_ref(), port);
        trace!(port, "SNAT port released");
        true
    }

    /// Move every lease older than the TTL back to the free set.
    /// Returns the number of ports reclaimed.
    pub fn reclaim_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut reclaimed = 0;
        for (port, lease) in self.leases.entries() {
            if now - lease.value <= self.ttl_ms {
                continue;
            }
            if self.leases.remove(&port).is_some() {
                mark_free(self.free.as_ref(), port);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            debug!(reclaimed, "reclaimed expired SNAT ports");
        }
        reclaimed
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.leases.len()
    }

    pub fn free_ports(&self) -> Vec<u16> {
        self.free.keys()
    }

    pub fn leased_ports(&self) -> Vec<u16> {
        self.leases.keys()
    }

    pub fn range(&self) -> std::ops::Range<u16> {
        self.min..self.max
    }
}

fn mark_free(free: &dyn VersionedStore<u16, ()>, port: u16) {
    let result: Result<_, StoreError> = free.compute(&port, &mut |_, _| Ok(()));
    if let Err(e) = result {
        warn!(port, error = %e, "failed to return SNAT port to the pool");
    }
}
