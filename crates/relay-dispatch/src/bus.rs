//! Message bus: subscription bookkeeping and the emission loop.
//!
//! A [`MessageBus`] is an explicit, caller-owned value; independently
//! constructed buses (one per test, one per simulation shard) are fully
//! isolated from each other. Each bus gets a process-unique sequential
//! [`BusId`] which partitions handler-side dispatcher storage.
//!
//! The bus mirrors every registration made through a
//! [`MessageHandler`](crate::MessageHandler): per classification it keeps
//! type-keyed, priority-ordered, insertion-ordered sets of subscribed
//! handlers, ref-counted per owner. Emission walks that bookkeeping:
//! every primary priority in ascending order, then the global accept-all
//! handlers, then every post-processing priority in ascending order. The
//! route plan is snapshotted before any handler runs, so re-entrant
//! registration or emission from inside a handler affects the next
//! emission, never the one in flight.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use relay_message::{BroadcastMessage, EntityId, Message, TargetedMessage, UntargetedMessage};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::facade::MessageHandler;

static NEXT_BUS_INDEX: AtomicUsize = AtomicUsize::new(0);

/// Monotonically assigned sequential bus index.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusId(usize);

impl BusId {
    fn next() -> Self {
        Self(NEXT_BUS_INDEX.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw index value.
    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }
}

impl core::fmt::Debug for BusId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BusId({})", self.0)
    }
}

/// Which routing table a scoped subscription lands in.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RouteKind {
    Untargeted { post: bool },
    Targeted { post: bool },
    Broadcast { post: bool },
}

/// Classification for global accept-all subscriptions.
#[derive(Debug, Clone, Copy)]
pub(crate) enum GlobalClass {
    Untargeted,
    Targeted,
    Broadcast,
}

/// One subscribed handler, ref-counted per owner so the bus's own
/// bookkeeping mirrors every individual register call.
struct RouteEntry {
    handler: Weak<MessageHandler>,
    count: usize,
}

/// Handlers invoked at one priority, in registration order.
type Wave = (i32, SmallVec<[Arc<MessageHandler>; 4]>);

/// Type-keyed, priority-ordered subscription table for one classification.
#[derive(Default)]
struct RouteTable {
    by_type: HashMap<TypeId, BTreeMap<i32, IndexMap<EntityId, RouteEntry>>>,
}

impl RouteTable {
    fn subscribe(&mut self, handler: &Arc<MessageHandler>, type_id: TypeId, priority: i32) {
        self.by_type
            .entry(type_id)
            .or_default()
            .entry(priority)
            .or_default()
            .entry(handler.owner())
            .or_insert_with(|| RouteEntry {
                handler: Arc::downgrade(handler),
                count: 0,
            })
            .count += 1;
    }

    fn unsubscribe(&mut self, type_id: TypeId, priority: i32, owner: EntityId) {
        let Some(by_priority) = self.by_type.get_mut(&type_id) else {
            return;
        };
        if let Some(entries) = by_priority.get_mut(&priority) {
            if let Some(entry) = entries.get_mut(&owner) {
                entry.count -= 1;
                if entry.count == 0 {
                    entries.shift_remove(&owner);
                }
            }
            if entries.is_empty() {
                by_priority.remove(&priority);
            }
        }
        if by_priority.is_empty() {
            self.by_type.remove(&type_id);
        }
    }

    /// Collect the ascending-priority emission plan for `type_id`,
    /// pruning subscriptions whose handler has been dropped.
    fn plan(&mut self, type_id: TypeId) -> SmallVec<[Wave; 4]> {
        let Some(by_priority) = self.by_type.get_mut(&type_id) else {
            return SmallVec::new();
        };

        let mut waves: SmallVec<[Wave; 4]> = SmallVec::new();
        let mut emptied: SmallVec<[i32; 4]> = SmallVec::new();
        for (&priority, entries) in by_priority.iter_mut() {
            entries.retain(|_, entry| entry.handler.strong_count() > 0);
            if entries.is_empty() {
                emptied.push(priority);
                continue;
            }
            let wave = entries
                .values()
                .filter_map(|entry| entry.handler.upgrade())
                .collect();
            waves.push((priority, wave));
        }

        for priority in emptied {
            by_priority.remove(&priority);
        }
        if by_priority.is_empty() {
            self.by_type.remove(&type_id);
        }
        waves
    }

    fn subscriber_count(&self, type_id: TypeId) -> usize {
        self.by_type
            .get(&type_id)
            .map_or(0, |by_priority| by_priority.values().map(IndexMap::len).sum())
    }
}

/// Subscription set for one global accept-all classification.
#[derive(Default)]
struct GlobalRoutes {
    entries: IndexMap<EntityId, RouteEntry>,
}

impl GlobalRoutes {
    fn subscribe(&mut self, handler: &Arc<MessageHandler>) {
        self.entries
            .entry(handler.owner())
            .or_insert_with(|| RouteEntry {
                handler: Arc::downgrade(handler),
                count: 0,
            })
            .count += 1;
    }

    fn unsubscribe(&mut self, owner: EntityId) {
        if let Some(entry) = self.entries.get_mut(&owner) {
            entry.count -= 1;
            if entry.count == 0 {
                self.entries.shift_remove(&owner);
            }
        }
    }

    fn plan(&mut self) -> SmallVec<[Arc<MessageHandler>; 4]> {
        self.entries
            .retain(|_, entry| entry.handler.strong_count() > 0);
        self.entries
            .values()
            .filter_map(|entry| entry.handler.upgrade())
            .collect()
    }
}

#[derive(Default)]
struct RouterState {
    untargeted: RouteTable,
    untargeted_post: RouteTable,
    targeted: RouteTable,
    targeted_post: RouteTable,
    broadcast: RouteTable,
    broadcast_post: RouteTable,
    global_untargeted: GlobalRoutes,
    global_targeted: GlobalRoutes,
    global_broadcast: GlobalRoutes,
}

impl RouterState {
    fn table_mut(&mut self, kind: RouteKind) -> &mut RouteTable {
        match kind {
            RouteKind::Untargeted { post: false } => &mut self.untargeted,
            RouteKind::Untargeted { post: true } => &mut self.untargeted_post,
            RouteKind::Targeted { post: false } => &mut self.targeted,
            RouteKind::Targeted { post: true } => &mut self.targeted_post,
            RouteKind::Broadcast { post: false } => &mut self.broadcast,
            RouteKind::Broadcast { post: true } => &mut self.broadcast_post,
        }
    }

    fn globals_mut(&mut self, class: GlobalClass) -> &mut GlobalRoutes {
        match class {
            GlobalClass::Untargeted => &mut self.global_untargeted,
            GlobalClass::Targeted => &mut self.global_targeted,
            GlobalClass::Broadcast => &mut self.global_broadcast,
        }
    }
}

struct BusInner {
    id: BusId,
    state: RwLock<RouterState>,
}

/// Cheaply cloneable handle to one bus instance.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// Create an isolated bus with a fresh sequential index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                id: BusId::next(),
                state: RwLock::new(RouterState::default()),
            }),
        }
    }

    /// This bus's sequential index.
    #[must_use]
    pub fn id(&self) -> BusId {
        self.inner.id
    }

    /// Record a scoped subscription; returns the bus-side deregistration
    /// action composed into the caller's [`Registration`](crate::Registration).
    pub(crate) fn subscribe(
        &self,
        handler: &Arc<MessageHandler>,
        kind: RouteKind,
        type_id: TypeId,
        priority: i32,
    ) -> Box<dyn FnOnce() + Send> {
        self.inner
            .state
            .write()
            .table_mut(kind)
            .subscribe(handler, type_id, priority);
        debug!(
            "bus {}: subscribe owner={} kind={:?} priority={}",
            self.inner.id.raw(),
            handler.owner(),
            kind,
            priority
        );

        let inner = Arc::downgrade(&self.inner);
        let owner = handler.owner();
        Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .state
                    .write()
                    .table_mut(kind)
                    .unsubscribe(type_id, priority, owner);
            }
        })
    }

    /// Record a global accept-all subscription for one classification.
    pub(crate) fn subscribe_global(
        &self,
        handler: &Arc<MessageHandler>,
        class: GlobalClass,
    ) -> Box<dyn FnOnce() + Send> {
        self.inner
            .state
            .write()
            .globals_mut(class)
            .subscribe(handler);
        debug!(
            "bus {}: subscribe-global owner={} class={:?}",
            self.inner.id.raw(),
            handler.owner(),
            class
        );

        let inner = Arc::downgrade(&self.inner);
        let owner = handler.owner();
        Box::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.state.write().globals_mut(class).unsubscribe(owner);
            }
        })
    }

    /// Deliver an untargeted message to every subscribed handler.
    pub fn emit_untargeted<M: UntargetedMessage>(&self, message: &mut M) {
        let type_id = TypeId::of::<M>();
        let (primary, globals, post) = {
            let mut state = self.inner.state.write();
            (
                state.untargeted.plan(type_id),
                state.global_untargeted.plan(),
                state.untargeted_post.plan(type_id),
            )
        };
        trace!(
            "bus {}: emit untargeted {}",
            self.inner.id.raw(),
            core::any::type_name::<M>()
        );

        for (priority, wave) in &primary {
            for handler in wave {
                handler.handle_untargeted(message, self, *priority);
            }
        }
        for handler in &globals {
            handler.handle_global_untargeted(message, self);
        }
        for (priority, wave) in &post {
            for handler in wave {
                handler.handle_untargeted_post(message, self, *priority);
            }
        }
    }

    /// Deliver a targeted message: exact-target registrations first
    /// within each priority, then any-target ones, then the global pass,
    /// then the post-processing priorities.
    pub fn emit_targeted<M: TargetedMessage>(&self, target: EntityId, message: &mut M) {
        let type_id = TypeId::of::<M>();
        let (primary, globals, post) = {
            let mut state = self.inner.state.write();
            (
                state.targeted.plan(type_id),
                state.global_targeted.plan(),
                state.targeted_post.plan(type_id),
            )
        };
        trace!(
            "bus {}: emit targeted {} target={}",
            self.inner.id.raw(),
            core::any::type_name::<M>(),
            target
        );

        for (priority, wave) in &primary {
            for handler in wave {
                handler.handle_targeted(target, message, self, *priority);
                handler.handle_any_targeted(target, message, self, *priority);
            }
        }
        for handler in &globals {
            handler.handle_global_targeted(target, message, self);
        }
        for (priority, wave) in &post {
            for handler in wave {
                handler.handle_targeted_post(target, message, self, *priority);
                handler.handle_any_targeted_post(target, message, self, *priority);
            }
        }
    }

    /// Deliver a broadcast message from `source`.
    pub fn emit_broadcast<M: BroadcastMessage>(&self, source: EntityId, message: &mut M) {
        let type_id = TypeId::of::<M>();
        let (primary, globals, post) = {
            let mut state = self.inner.state.write();
            (
                state.broadcast.plan(type_id),
                state.global_broadcast.plan(),
                state.broadcast_post.plan(type_id),
            )
        };
        trace!(
            "bus {}: emit broadcast {} source={}",
            self.inner.id.raw(),
            core::any::type_name::<M>(),
            source
        );

        for (priority, wave) in &primary {
            for handler in wave {
                handler.handle_broadcast(source, message, self, *priority);
                handler.handle_any_broadcast(source, message, self, *priority);
            }
        }
        for handler in &globals {
            handler.handle_global_broadcast(source, message, self);
        }
        for (priority, wave) in &post {
            for handler in wave {
                handler.handle_broadcast_post(source, message, self, *priority);
                handler.handle_any_broadcast_post(source, message, self, *priority);
            }
        }
    }

    /// Number of live primary subscriptions for `M` across all
    /// classifications (post-processing and global subscriptions not
    /// included). Mostly useful for tests and diagnostics.
    #[must_use]
    pub fn subscriber_count<M: Message>(&self) -> usize {
        let type_id = TypeId::of::<M>();
        let state = self.inner.state.read();
        state.untargeted.subscriber_count(type_id)
            + state.targeted.subscriber_count(type_id)
            + state.broadcast.subscriber_count(type_id)
    }
}

impl core::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageBus")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}
