//! Priority- and context-keyed collections of handler caches.
//!
//! A [`PriorityTable`] holds one cache per distinct integer priority
//! (lower fires first; the router walks priorities in ascending order and
//! dispatches each one explicitly). A [`ContextTable`] adds a scoping
//! identity on top, for registrations bound to a specific target or
//! source entity. Both prune empty interior containers on release so
//! occupancy checks stay meaningful.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;
use relay_message::EntityId;

use crate::cache::HandlerCache;
use crate::handler::HandlerKey;

/// Ordered-by-priority collection of handler caches.
pub(crate) struct PriorityTable<H> {
    buckets: BTreeMap<i32, HandlerCache<H>>,
}

impl<H> Default for PriorityTable<H> {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }
}

impl<H: Clone> PriorityTable<H> {
    /// Get the cache for `priority`, creating an empty one on first use.
    pub fn get_or_create(&mut self, priority: i32) -> &mut HandlerCache<H> {
        self.buckets.entry(priority).or_default()
    }

    /// Snapshot the cache at `priority`, or `None` when no handler is
    /// registered there (no allocation on that path).
    pub fn snapshot_at(&mut self, priority: i32) -> Option<Arc<[H]>> {
        self.buckets.get_mut(&priority).map(HandlerCache::snapshot)
    }

    /// Drop one registration, removing the priority bucket the moment its
    /// cache empties.
    pub fn release(&mut self, priority: i32, key: HandlerKey) {
        let Some(cache) = self.buckets.get_mut(&priority) else {
            return;
        };

        cache.release(key);
        if cache.is_empty() {
            self.buckets.remove(&priority);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Identity-keyed collection of priority tables, for delivery scoped to a
/// specific target or source entity.
pub(crate) struct ContextTable<H> {
    scopes: HashMap<EntityId, PriorityTable<H>>,
}

impl<H> Default for ContextTable<H> {
    fn default() -> Self {
        Self {
            scopes: HashMap::new(),
        }
    }
}

impl<H: Clone> ContextTable<H> {
    pub fn get_or_create(&mut self, context: EntityId, priority: i32) -> &mut HandlerCache<H> {
        self.scopes.entry(context).or_default().get_or_create(priority)
    }

    /// Snapshot the cache for an exact `(context, priority)` pair.
    ///
    /// Registrations for other contexts are invisible here; that is the
    /// whole isolation contract for targeted and sourced delivery.
    pub fn snapshot_at(&mut self, context: EntityId, priority: i32) -> Option<Arc<[H]>> {
        self.scopes.get_mut(&context)?.snapshot_at(priority)
    }

    /// Drop one registration, pruning the context entry once its priority
    /// table empties.
    pub fn release(&mut self, context: EntityId, priority: i32, key: HandlerKey) {
        let Some(table) = self.scopes.get_mut(&context) else {
            return;
        };

        table.release(priority, key);
        if table.is_empty() {
            self.scopes.remove(&context);
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}
