//! Per-message-type dispatch engine.
//!
//! A [`TypedDispatcher`] owns every delivery-shape table for a single
//! concrete message type: untargeted, targeted, any-target, sourced
//! broadcast, and any-source, each with a separate post-processing table.
//! Dispatchers are generic over the message type and looked up by
//! `TypeId`, so a message travels as `&mut M` end to end; there is no
//! type-erased buffer to reinterpret.
//!
//! Invocation discipline: the table lock is held only long enough to
//! fetch the snapshot for the requested bucket, never across a handler
//! call. Handlers are therefore free to register, deregister, or emit
//! again from inside their own invocation; the in-flight snapshot is
//! immutable, and a handler panic propagates with no shared state left
//! locked or half-updated.

use std::sync::Arc;

use parking_lot::Mutex;
use relay_message::{EntityId, Message};

use crate::cache::HandlerCache;
use crate::handler::{
    AnyContextMessageFn, AnyMessageFn, ContextMessageFn, HandlerKey, MessageFn,
};
use crate::table::{ContextTable, PriorityTable};
use crate::token::{RevokeAddr, RevokeTarget};

/// All delivery-shape tables for one message type.
struct DispatchTables<M> {
    untargeted: PriorityTable<Arc<MessageFn<M>>>,
    untargeted_post: PriorityTable<Arc<MessageFn<M>>>,
    targeted: ContextTable<Arc<MessageFn<M>>>,
    targeted_post: ContextTable<Arc<MessageFn<M>>>,
    any_targeted: PriorityTable<Arc<ContextMessageFn<M>>>,
    any_targeted_post: PriorityTable<Arc<ContextMessageFn<M>>>,
    broadcast: ContextTable<Arc<MessageFn<M>>>,
    broadcast_post: ContextTable<Arc<MessageFn<M>>>,
    any_broadcast: PriorityTable<Arc<ContextMessageFn<M>>>,
    any_broadcast_post: PriorityTable<Arc<ContextMessageFn<M>>>,
}

impl<M> Default for DispatchTables<M> {
    fn default() -> Self {
        Self {
            untargeted: PriorityTable::default(),
            untargeted_post: PriorityTable::default(),
            targeted: ContextTable::default(),
            targeted_post: ContextTable::default(),
            any_targeted: PriorityTable::default(),
            any_targeted_post: PriorityTable::default(),
            broadcast: ContextTable::default(),
            broadcast_post: ContextTable::default(),
            any_broadcast: PriorityTable::default(),
            any_broadcast_post: PriorityTable::default(),
        }
    }
}

/// Dispatch engine for one concrete message type on one bus.
pub(crate) struct TypedDispatcher<M: Message> {
    tables: Mutex<DispatchTables<M>>,
}

impl<M: Message> Default for TypedDispatcher<M> {
    fn default() -> Self {
        Self {
            tables: Mutex::new(DispatchTables::default()),
        }
    }
}

impl<M: Message> TypedDispatcher<M> {
    pub fn new() -> Self {
        Self::default()
    }

    // Registration. Each `add_*` stores the active callable under the
    // caller's dedup key and returns the address a token revokes by.

    pub fn add_untargeted(
        &self,
        key: HandlerKey,
        active: Arc<MessageFn<M>>,
        priority: i32,
        post: bool,
    ) -> RevokeAddr {
        let mut tables = self.tables.lock();
        let table = if post {
            &mut tables.untargeted_post
        } else {
            &mut tables.untargeted
        };
        table.get_or_create(priority).insert(key, active);
        RevokeAddr::Untargeted {
            post,
            priority,
            key,
        }
    }

    pub fn add_targeted(
        &self,
        target: EntityId,
        key: HandlerKey,
        active: Arc<MessageFn<M>>,
        priority: i32,
        post: bool,
    ) -> RevokeAddr {
        let mut tables = self.tables.lock();
        let table = if post {
            &mut tables.targeted_post
        } else {
            &mut tables.targeted
        };
        table.get_or_create(target, priority).insert(key, active);
        RevokeAddr::Targeted {
            target,
            post,
            priority,
            key,
        }
    }

    pub fn add_any_targeted(
        &self,
        key: HandlerKey,
        active: Arc<ContextMessageFn<M>>,
        priority: i32,
        post: bool,
    ) -> RevokeAddr {
        let mut tables = self.tables.lock();
        let table = if post {
            &mut tables.any_targeted_post
        } else {
            &mut tables.any_targeted
        };
        table.get_or_create(priority).insert(key, active);
        RevokeAddr::AnyTargeted {
            post,
            priority,
            key,
        }
    }

    pub fn add_broadcast(
        &self,
        source: EntityId,
        key: HandlerKey,
        active: Arc<MessageFn<M>>,
        priority: i32,
        post: bool,
    ) -> RevokeAddr {
        let mut tables = self.tables.lock();
        let table = if post {
            &mut tables.broadcast_post
        } else {
            &mut tables.broadcast
        };
        table.get_or_create(source, priority).insert(key, active);
        RevokeAddr::Broadcast {
            source,
            post,
            priority,
            key,
        }
    }

    pub fn add_any_broadcast(
        &self,
        key: HandlerKey,
        active: Arc<ContextMessageFn<M>>,
        priority: i32,
        post: bool,
    ) -> RevokeAddr {
        let mut tables = self.tables.lock();
        let table = if post {
            &mut tables.any_broadcast_post
        } else {
            &mut tables.any_broadcast
        };
        table.get_or_create(priority).insert(key, active);
        RevokeAddr::AnyBroadcast {
            post,
            priority,
            key,
        }
    }

    // Dispatch. Absent bucket or context: no-op, no allocation.

    pub fn handle_untargeted(&self, message: &mut M, priority: i32, post: bool) {
        let snapshot = {
            let mut tables = self.tables.lock();
            let table = if post {
                &mut tables.untargeted_post
            } else {
                &mut tables.untargeted
            };
            table.snapshot_at(priority)
        };
        if let Some(snapshot) = snapshot {
            for handler in snapshot.iter() {
                handler(message);
            }
        }
    }

    pub fn handle_targeted(&self, target: EntityId, message: &mut M, priority: i32, post: bool) {
        let snapshot = {
            let mut tables = self.tables.lock();
            let table = if post {
                &mut tables.targeted_post
            } else {
                &mut tables.targeted
            };
            table.snapshot_at(target, priority)
        };
        if let Some(snapshot) = snapshot {
            for handler in snapshot.iter() {
                handler(message);
            }
        }
    }

    pub fn handle_any_targeted(
        &self,
        target: EntityId,
        message: &mut M,
        priority: i32,
        post: bool,
    ) {
        let snapshot = {
            let mut tables = self.tables.lock();
            let table = if post {
                &mut tables.any_targeted_post
            } else {
                &mut tables.any_targeted
            };
            table.snapshot_at(priority)
        };
        if let Some(snapshot) = snapshot {
            for handler in snapshot.iter() {
                handler(target, message);
            }
        }
    }

    pub fn handle_broadcast(&self, source: EntityId, message: &mut M, priority: i32, post: bool) {
        let snapshot = {
            let mut tables = self.tables.lock();
            let table = if post {
                &mut tables.broadcast_post
            } else {
                &mut tables.broadcast
            };
            table.snapshot_at(source, priority)
        };
        if let Some(snapshot) = snapshot {
            for handler in snapshot.iter() {
                handler(message);
            }
        }
    }

    pub fn handle_any_broadcast(
        &self,
        source: EntityId,
        message: &mut M,
        priority: i32,
        post: bool,
    ) {
        let snapshot = {
            let mut tables = self.tables.lock();
            let table = if post {
                &mut tables.any_broadcast_post
            } else {
                &mut tables.any_broadcast
            };
            table.snapshot_at(priority)
        };
        if let Some(snapshot) = snapshot {
            for handler in snapshot.iter() {
                handler(source, message);
            }
        }
    }
}

impl<M: Message> RevokeTarget for TypedDispatcher<M> {
    fn revoke(&self, addr: &RevokeAddr) {
        let mut tables = self.tables.lock();
        match *addr {
            RevokeAddr::Untargeted {
                post,
                priority,
                key,
            } => {
                let table = if post {
                    &mut tables.untargeted_post
                } else {
                    &mut tables.untargeted
                };
                table.release(priority, key);
            }
            RevokeAddr::Targeted {
                target,
                post,
                priority,
                key,
            } => {
                let table = if post {
                    &mut tables.targeted_post
                } else {
                    &mut tables.targeted
                };
                table.release(target, priority, key);
            }
            RevokeAddr::AnyTargeted {
                post,
                priority,
                key,
            } => {
                let table = if post {
                    &mut tables.any_targeted_post
                } else {
                    &mut tables.any_targeted
                };
                table.release(priority, key);
            }
            RevokeAddr::Broadcast {
                source,
                post,
                priority,
                key,
            } => {
                let table = if post {
                    &mut tables.broadcast_post
                } else {
                    &mut tables.broadcast
                };
                table.release(source, priority, key);
            }
            RevokeAddr::AnyBroadcast {
                post,
                priority,
                key,
            } => {
                let table = if post {
                    &mut tables.any_broadcast_post
                } else {
                    &mut tables.any_broadcast
                };
                table.release(priority, key);
            }
            // Global registrations live on GlobalTables, never here.
            RevokeAddr::GlobalAcceptAll { .. } => {}
        }
    }
}

/// Accept-all caches for one (handler, bus) pair.
///
/// Global handlers fire for every concrete message of their
/// classification, so they are keyed by the base message contract rather
/// than a concrete type, and carry no priority or context dimension.
#[derive(Default)]
pub(crate) struct GlobalTables {
    caches: Mutex<GlobalCaches>,
}

#[derive(Default)]
struct GlobalCaches {
    untargeted: HandlerCache<Arc<AnyMessageFn>>,
    targeted: HandlerCache<Arc<AnyContextMessageFn>>,
    broadcast: HandlerCache<Arc<AnyContextMessageFn>>,
}

impl GlobalTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the accept-all triple as one unit.
    pub fn add(
        &self,
        untargeted: (HandlerKey, Arc<AnyMessageFn>),
        targeted: (HandlerKey, Arc<AnyContextMessageFn>),
        broadcast: (HandlerKey, Arc<AnyContextMessageFn>),
    ) -> RevokeAddr {
        let mut caches = self.caches.lock();
        caches.untargeted.insert(untargeted.0, untargeted.1);
        caches.targeted.insert(targeted.0, targeted.1);
        caches.broadcast.insert(broadcast.0, broadcast.1);
        RevokeAddr::GlobalAcceptAll {
            untargeted: untargeted.0,
            targeted: targeted.0,
            broadcast: broadcast.0,
        }
    }

    pub fn handle_untargeted(&self, message: &mut dyn Message) {
        let snapshot = self.caches.lock().untargeted.snapshot();
        for handler in snapshot.iter() {
            handler(message);
        }
    }

    pub fn handle_targeted(&self, target: EntityId, message: &mut dyn Message) {
        let snapshot = self.caches.lock().targeted.snapshot();
        for handler in snapshot.iter() {
            handler(target, message);
        }
    }

    pub fn handle_broadcast(&self, source: EntityId, message: &mut dyn Message) {
        let snapshot = self.caches.lock().broadcast.snapshot();
        for handler in snapshot.iter() {
            handler(source, message);
        }
    }
}

impl RevokeTarget for GlobalTables {
    fn revoke(&self, addr: &RevokeAddr) {
        let RevokeAddr::GlobalAcceptAll {
            untargeted,
            targeted,
            broadcast,
        } = *addr
        else {
            return;
        };

        let mut caches = self.caches.lock();
        caches.untargeted.release(untargeted);
        caches.targeted.release(targeted);
        caches.broadcast.release(broadcast);
    }
}
