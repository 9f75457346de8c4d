//! Ref-counted handler cache with version-stamped snapshots.
//!
//! The cache is the primitive every delivery table is built from. It
//! holds one entry per distinct handler (duplicate registrations only
//! bump a ref count) and hands out an immutable, shared snapshot of the
//! active callables for iteration. Structural changes bump a version
//! counter; the snapshot is rebuilt lazily on the next request, never in
//! place, so an in-flight dispatch iterating an already-fetched snapshot
//! always completes unchanged even when its own handlers register or
//! deregister mid-pass.
//!
//! Dispatch order within the cache is insertion order. That is a
//! deliberate contract, not container happenstance: entries live in an
//! `IndexMap` and are removed with `shift_remove`.

use std::sync::Arc;

use indexmap::IndexMap;
use indexmap::map::Entry;

use crate::handler::HandlerKey;

/// One registered handler with its duplicate-registration count.
struct CacheEntry<H> {
    /// The callable invoked at dispatch time. Fixed to the value supplied
    /// by the first registration for this key; later duplicates keep it.
    active: H,
    /// Number of outstanding registrations for this key, always >= 1.
    ref_count: usize,
}

/// Ref-counted map of handlers plus a lazily rebuilt dispatch snapshot.
pub(crate) struct HandlerCache<H> {
    entries: IndexMap<HandlerKey, CacheEntry<H>>,
    version: u64,
    snapshot: Arc<[H]>,
    snapshot_version: u64,
}

impl<H> Default for HandlerCache<H> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
            version: 0,
            snapshot: Vec::new().into(),
            snapshot_version: 0,
        }
    }
}

impl<H: Clone> HandlerCache<H> {
    /// Register a handler under its dedup key.
    ///
    /// A new key stores `active` with a ref count of 1 and invalidates the
    /// snapshot; a duplicate key only increments the ref count, leaving
    /// both the active callable and the snapshot untouched.
    pub fn insert(&mut self, key: HandlerKey, active: H) {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().ref_count += 1;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    active,
                    ref_count: 1,
                });
                self.version += 1;
            }
        }
    }

    /// Drop one registration for `key`.
    ///
    /// The entry is removed (and the snapshot invalidated) the moment its
    /// ref count reaches zero. Unknown keys are a safe no-op.
    pub fn release(&mut self, key: HandlerKey) {
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };

        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            self.entries.shift_remove(&key);
            self.version += 1;
        }
    }

    /// Get the current dispatch snapshot, rebuilding it only if a
    /// registration or removal happened since the last request.
    ///
    /// The returned list is immutable and independently owned: later
    /// structural changes produce a *new* snapshot rather than mutating
    /// this one, so callers may iterate it while handlers re-enter the
    /// cache freely.
    pub fn snapshot(&mut self) -> Arc<[H]> {
        if self.snapshot_version != self.version {
            self.snapshot = self.entries.values().map(|e| e.active.clone()).collect();
            self.snapshot_version = self.version;
        }
        Arc::clone(&self.snapshot)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<H> core::fmt::Debug for HandlerCache<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerCache")
            .field("entries", &self.entries.len())
            .field("version", &self.version)
            .field("snapshot_version", &self.snapshot_version)
            .finish_non_exhaustive()
    }
}
