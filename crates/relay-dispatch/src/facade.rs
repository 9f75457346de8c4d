//! Per-entity message handler: the front door for registration and
//! delivery.
//!
//! One [`MessageHandler`] exists per message-capable entity. It owns a
//! typed dispatcher per `(bus, message type)` pair, created lazily on
//! first registration, and gates all delivery on an `active` flag so an
//! entity can go quiet (despawn, pause) without disturbing its
//! registration state. Delivery for a type with no registrations costs a
//! single map lookup and allocates nothing.

use std::any::{Any, TypeId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;
use relay_message::{BroadcastMessage, EntityId, Message, TargetedMessage, UntargetedMessage};
use tracing::trace;

use crate::bus::{BusId, GlobalClass, MessageBus, RouteKind};
use crate::dispatcher::{GlobalTables, TypedDispatcher};
use crate::handler::{
    AnyContextMessageFn, AnyMessageFn, ContextMessageFn, ContextMessageValueFn, HandlerKey,
    MessageFn, MessageValueFn,
};
use crate::token::Registration;

/// Adapt a by-value handler to the stored by-reference shape. The clone
/// happens per invocation; the dedup key stays the caller's original
/// handler, not this adapter.
fn adapt<M: Message + Clone>(handler: Arc<MessageValueFn<M>>) -> Arc<MessageFn<M>> {
    Arc::new(move |message: &mut M| handler(message.clone()))
}

fn adapt_context<M: Message + Clone>(
    handler: Arc<ContextMessageValueFn<M>>,
) -> Arc<ContextMessageFn<M>> {
    Arc::new(move |context, message: &mut M| handler(context, message.clone()))
}

/// Per-entity registration and delivery front door.
pub struct MessageHandler {
    owner: EntityId,
    active: AtomicBool,
    /// Typed dispatchers, partitioned by bus index so concurrent bus
    /// instances never see each other's registrations.
    dispatchers: RwLock<HashMap<(BusId, TypeId), Arc<dyn Any + Send + Sync>>>,
    /// Global accept-all tables, one set per bus.
    globals: RwLock<HashMap<BusId, Arc<GlobalTables>>>,
}

impl MessageHandler {
    /// Create a handler for `owner`. Starts inactive; no tables are
    /// allocated until the first registration.
    #[must_use]
    pub fn new(owner: EntityId) -> Arc<Self> {
        Arc::new(Self {
            owner,
            active: AtomicBool::new(false),
            dispatchers: RwLock::new(HashMap::new()),
            globals: RwLock::new(HashMap::new()),
        })
    }

    /// The owning entity's identity.
    #[must_use]
    pub fn owner(&self) -> EntityId {
        self.owner
    }

    /// Whether delivery is currently enabled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Enable or disable delivery. Registration state is untouched;
    /// re-activating immediately resumes delivery to the same handlers.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    fn dispatcher_for<M: Message>(&self, bus: &MessageBus) -> Option<Arc<TypedDispatcher<M>>> {
        let dispatchers = self.dispatchers.read();
        let entry = dispatchers.get(&(bus.id(), TypeId::of::<M>()))?;
        Arc::clone(entry).downcast::<TypedDispatcher<M>>().ok()
    }

    fn dispatcher_or_create<M: Message>(&self, bus: &MessageBus) -> Arc<TypedDispatcher<M>> {
        let key = (bus.id(), TypeId::of::<M>());
        let mut dispatchers = self.dispatchers.write();
        let entry = dispatchers.entry(key).or_insert_with(|| {
            trace!(
                "handler {}: new dispatcher for {}",
                self.owner,
                core::any::type_name::<M>()
            );
            let dispatcher: Arc<dyn Any + Send + Sync> = Arc::new(TypedDispatcher::<M>::new());
            dispatcher
        });
        Arc::clone(entry)
            .downcast::<TypedDispatcher<M>>()
            .unwrap_or_else(|_| unreachable!("dispatcher is stored under its own TypeId"))
    }

    fn globals_for(&self, bus: &MessageBus) -> Option<Arc<GlobalTables>> {
        self.globals.read().get(&bus.id()).map(Arc::clone)
    }

    fn globals_or_create(&self, bus: &MessageBus) -> Arc<GlobalTables> {
        let mut globals = self.globals.write();
        Arc::clone(
            globals
                .entry(bus.id())
                .or_insert_with(|| Arc::new(GlobalTables::new())),
        )
    }

    // Registration: untargeted.

    /// Register a by-reference handler for every `M` emitted untargeted.
    pub fn register_untargeted<M: UntargetedMessage>(
        self: &Arc<Self>,
        handler: Arc<MessageFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_untargeted::<M>(key, handler, priority, false, bus)
    }

    /// By-value form of [`register_untargeted`](Self::register_untargeted).
    pub fn register_untargeted_owned<M: UntargetedMessage + Clone>(
        self: &Arc<Self>,
        handler: Arc<MessageValueFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_untargeted::<M>(key, adapt(handler), priority, false, bus)
    }

    /// Register a post-processor: runs only after every primary handler
    /// across all priorities has completed for an emission.
    pub fn register_untargeted_post<M: UntargetedMessage>(
        self: &Arc<Self>,
        handler: Arc<MessageFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_untargeted::<M>(key, handler, priority, true, bus)
    }

    /// By-value form of [`register_untargeted_post`](Self::register_untargeted_post).
    pub fn register_untargeted_post_owned<M: UntargetedMessage + Clone>(
        self: &Arc<Self>,
        handler: Arc<MessageValueFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_untargeted::<M>(key, adapt(handler), priority, true, bus)
    }

    fn add_untargeted<M: Message>(
        self: &Arc<Self>,
        key: HandlerKey,
        active: Arc<MessageFn<M>>,
        priority: i32,
        post: bool,
        bus: &MessageBus,
    ) -> Registration {
        let dispatcher = self.dispatcher_or_create::<M>(bus);
        let unsubscribe = bus.subscribe(
            self,
            RouteKind::Untargeted { post },
            TypeId::of::<M>(),
            priority,
        );
        let addr = dispatcher.add_untargeted(key, active, priority, post);
        let revoker = Arc::downgrade(&dispatcher);
        Registration::new(revoker, addr, unsubscribe)
    }

    // Registration: targeted at a specific entity.

    /// Register a by-reference handler for `M` messages targeted exactly
    /// at `target`.
    pub fn register_targeted<M: TargetedMessage>(
        self: &Arc<Self>,
        target: EntityId,
        handler: Arc<MessageFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_targeted::<M>(target, key, handler, priority, false, bus)
    }

    /// By-value form of [`register_targeted`](Self::register_targeted).
    pub fn register_targeted_owned<M: TargetedMessage + Clone>(
        self: &Arc<Self>,
        target: EntityId,
        handler: Arc<MessageValueFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_targeted::<M>(target, key, adapt(handler), priority, false, bus)
    }

    /// Post-processing variant of [`register_targeted`](Self::register_targeted).
    pub fn register_targeted_post<M: TargetedMessage>(
        self: &Arc<Self>,
        target: EntityId,
        handler: Arc<MessageFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_targeted::<M>(target, key, handler, priority, true, bus)
    }

    /// By-value form of [`register_targeted_post`](Self::register_targeted_post).
    pub fn register_targeted_post_owned<M: TargetedMessage + Clone>(
        self: &Arc<Self>,
        target: EntityId,
        handler: Arc<MessageValueFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_targeted::<M>(target, key, adapt(handler), priority, true, bus)
    }

    fn add_targeted<M: Message>(
        self: &Arc<Self>,
        target: EntityId,
        key: HandlerKey,
        active: Arc<MessageFn<M>>,
        priority: i32,
        post: bool,
        bus: &MessageBus,
    ) -> Registration {
        let dispatcher = self.dispatcher_or_create::<M>(bus);
        let unsubscribe = bus.subscribe(
            self,
            RouteKind::Targeted { post },
            TypeId::of::<M>(),
            priority,
        );
        let addr = dispatcher.add_targeted(target, key, active, priority, post);
        let revoker = Arc::downgrade(&dispatcher);
        Registration::new(revoker, addr, unsubscribe)
    }

    // Registration: any target. The handler fires for every target and
    // receives the target as its context parameter.

    /// Register a by-reference handler for `M` messages aimed at any
    /// target; the handler receives the target alongside the message.
    pub fn register_any_targeted<M: TargetedMessage>(
        self: &Arc<Self>,
        handler: Arc<ContextMessageFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_any_targeted::<M>(key, handler, priority, false, bus)
    }

    /// By-value form of [`register_any_targeted`](Self::register_any_targeted).
    pub fn register_any_targeted_owned<M: TargetedMessage + Clone>(
        self: &Arc<Self>,
        handler: Arc<ContextMessageValueFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_any_targeted::<M>(key, adapt_context(handler), priority, false, bus)
    }

    /// Post-processing variant of [`register_any_targeted`](Self::register_any_targeted).
    pub fn register_any_targeted_post<M: TargetedMessage>(
        self: &Arc<Self>,
        handler: Arc<ContextMessageFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_any_targeted::<M>(key, handler, priority, true, bus)
    }

    /// By-value form of [`register_any_targeted_post`](Self::register_any_targeted_post).
    pub fn register_any_targeted_post_owned<M: TargetedMessage + Clone>(
        self: &Arc<Self>,
        handler: Arc<ContextMessageValueFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_any_targeted::<M>(key, adapt_context(handler), priority, true, bus)
    }

    fn add_any_targeted<M: Message>(
        self: &Arc<Self>,
        key: HandlerKey,
        active: Arc<ContextMessageFn<M>>,
        priority: i32,
        post: bool,
        bus: &MessageBus,
    ) -> Registration {
        let dispatcher = self.dispatcher_or_create::<M>(bus);
        let unsubscribe = bus.subscribe(
            self,
            RouteKind::Targeted { post },
            TypeId::of::<M>(),
            priority,
        );
        let addr = dispatcher.add_any_targeted(key, active, priority, post);
        let revoker = Arc::downgrade(&dispatcher);
        Registration::new(revoker, addr, unsubscribe)
    }

    // Registration: broadcast from a specific source.

    /// Register a by-reference handler for `M` broadcast from exactly
    /// `source`.
    pub fn register_broadcast<M: BroadcastMessage>(
        self: &Arc<Self>,
        source: EntityId,
        handler: Arc<MessageFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_broadcast::<M>(source, key, handler, priority, false, bus)
    }

    /// By-value form of [`register_broadcast`](Self::register_broadcast).
    pub fn register_broadcast_owned<M: BroadcastMessage + Clone>(
        self: &Arc<Self>,
        source: EntityId,
        handler: Arc<MessageValueFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_broadcast::<M>(source, key, adapt(handler), priority, false, bus)
    }

    /// Post-processing variant of [`register_broadcast`](Self::register_broadcast).
    pub fn register_broadcast_post<M: BroadcastMessage>(
        self: &Arc<Self>,
        source: EntityId,
        handler: Arc<MessageFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_broadcast::<M>(source, key, handler, priority, true, bus)
    }

    /// By-value form of [`register_broadcast_post`](Self::register_broadcast_post).
    pub fn register_broadcast_post_owned<M: BroadcastMessage + Clone>(
        self: &Arc<Self>,
        source: EntityId,
        handler: Arc<MessageValueFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_broadcast::<M>(source, key, adapt(handler), priority, true, bus)
    }

    fn add_broadcast<M: Message>(
        self: &Arc<Self>,
        source: EntityId,
        key: HandlerKey,
        active: Arc<MessageFn<M>>,
        priority: i32,
        post: bool,
        bus: &MessageBus,
    ) -> Registration {
        let dispatcher = self.dispatcher_or_create::<M>(bus);
        let unsubscribe = bus.subscribe(
            self,
            RouteKind::Broadcast { post },
            TypeId::of::<M>(),
            priority,
        );
        let addr = dispatcher.add_broadcast(source, key, active, priority, post);
        let revoker = Arc::downgrade(&dispatcher);
        Registration::new(revoker, addr, unsubscribe)
    }

    // Registration: broadcast from any source.

    /// Register a by-reference handler for `M` broadcast from any source;
    /// the handler receives the source alongside the message.
    pub fn register_any_broadcast<M: BroadcastMessage>(
        self: &Arc<Self>,
        handler: Arc<ContextMessageFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_any_broadcast::<M>(key, handler, priority, false, bus)
    }

    /// By-value form of [`register_any_broadcast`](Self::register_any_broadcast).
    pub fn register_any_broadcast_owned<M: BroadcastMessage + Clone>(
        self: &Arc<Self>,
        handler: Arc<ContextMessageValueFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_any_broadcast::<M>(key, adapt_context(handler), priority, false, bus)
    }

    /// Post-processing variant of [`register_any_broadcast`](Self::register_any_broadcast).
    pub fn register_any_broadcast_post<M: BroadcastMessage>(
        self: &Arc<Self>,
        handler: Arc<ContextMessageFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_any_broadcast::<M>(key, handler, priority, true, bus)
    }

    /// By-value form of [`register_any_broadcast_post`](Self::register_any_broadcast_post).
    pub fn register_any_broadcast_post_owned<M: BroadcastMessage + Clone>(
        self: &Arc<Self>,
        handler: Arc<ContextMessageValueFn<M>>,
        priority: i32,
        bus: &MessageBus,
    ) -> Registration {
        let key = HandlerKey::of(&handler);
        self.add_any_broadcast::<M>(key, adapt_context(handler), priority, true, bus)
    }

    fn add_any_broadcast<M: Message>(
        self: &Arc<Self>,
        key: HandlerKey,
        active: Arc<ContextMessageFn<M>>,
        priority: i32,
        post: bool,
        bus: &MessageBus,
    ) -> Registration {
        let dispatcher = self.dispatcher_or_create::<M>(bus);
        let unsubscribe = bus.subscribe(
            self,
            RouteKind::Broadcast { post },
            TypeId::of::<M>(),
            priority,
        );
        let addr = dispatcher.add_any_broadcast(key, active, priority, post);
        let revoker = Arc::downgrade(&dispatcher);
        Registration::new(revoker, addr, unsubscribe)
    }

    /// Register the global accept-all triple: the handlers fire for every
    /// concrete message of their classification emitted through `bus`,
    /// regardless of type, priority, or context. One token revokes all
    /// three.
    pub fn register_global_accept_all(
        self: &Arc<Self>,
        untargeted: Arc<AnyMessageFn>,
        targeted: Arc<AnyContextMessageFn>,
        broadcast: Arc<AnyContextMessageFn>,
        bus: &MessageBus,
    ) -> Registration {
        let globals = self.globals_or_create(bus);
        let mut unsubscribes = [
            Some(bus.subscribe_global(self, GlobalClass::Untargeted)),
            Some(bus.subscribe_global(self, GlobalClass::Targeted)),
            Some(bus.subscribe_global(self, GlobalClass::Broadcast)),
        ];
        let addr = globals.add(
            (HandlerKey::of(&untargeted), untargeted),
            (HandlerKey::of(&targeted), targeted),
            (HandlerKey::of(&broadcast), broadcast),
        );
        let unsubscribe = Box::new(move || {
            for unsubscribe in &mut unsubscribes {
                if let Some(unsubscribe) = unsubscribe.take() {
                    unsubscribe();
                }
            }
        });
        let revoker = Arc::downgrade(&globals);
        Registration::new(revoker, addr, unsubscribe)
    }

    // Delivery entry points, called by the bus. Every one is gated on
    // `active` and looks dispatchers up without creating them.

    pub fn handle_untargeted<M: UntargetedMessage>(
        &self,
        message: &mut M,
        bus: &MessageBus,
        priority: i32,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher_for::<M>(bus) {
            dispatcher.handle_untargeted(message, priority, false);
        }
    }

    pub fn handle_untargeted_post<M: UntargetedMessage>(
        &self,
        message: &mut M,
        bus: &MessageBus,
        priority: i32,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher_for::<M>(bus) {
            dispatcher.handle_untargeted(message, priority, true);
        }
    }

    pub fn handle_targeted<M: TargetedMessage>(
        &self,
        target: EntityId,
        message: &mut M,
        bus: &MessageBus,
        priority: i32,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher_for::<M>(bus) {
            dispatcher.handle_targeted(target, message, priority, false);
        }
    }

    pub fn handle_targeted_post<M: TargetedMessage>(
        &self,
        target: EntityId,
        message: &mut M,
        bus: &MessageBus,
        priority: i32,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher_for::<M>(bus) {
            dispatcher.handle_targeted(target, message, priority, true);
        }
    }

    pub fn handle_any_targeted<M: TargetedMessage>(
        &self,
        target: EntityId,
        message: &mut M,
        bus: &MessageBus,
        priority: i32,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher_for::<M>(bus) {
            dispatcher.handle_any_targeted(target, message, priority, false);
        }
    }

    pub fn handle_any_targeted_post<M: TargetedMessage>(
        &self,
        target: EntityId,
        message: &mut M,
        bus: &MessageBus,
        priority: i32,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher_for::<M>(bus) {
            dispatcher.handle_any_targeted(target, message, priority, true);
        }
    }

    pub fn handle_broadcast<M: BroadcastMessage>(
        &self,
        source: EntityId,
        message: &mut M,
        bus: &MessageBus,
        priority: i32,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher_for::<M>(bus) {
            dispatcher.handle_broadcast(source, message, priority, false);
        }
    }

    pub fn handle_broadcast_post<M: BroadcastMessage>(
        &self,
        source: EntityId,
        message: &mut M,
        bus: &MessageBus,
        priority: i32,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher_for::<M>(bus) {
            dispatcher.handle_broadcast(source, message, priority, true);
        }
    }

    pub fn handle_any_broadcast<M: BroadcastMessage>(
        &self,
        source: EntityId,
        message: &mut M,
        bus: &MessageBus,
        priority: i32,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher_for::<M>(bus) {
            dispatcher.handle_any_broadcast(source, message, priority, false);
        }
    }

    pub fn handle_any_broadcast_post<M: BroadcastMessage>(
        &self,
        source: EntityId,
        message: &mut M,
        bus: &MessageBus,
        priority: i32,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(dispatcher) = self.dispatcher_for::<M>(bus) {
            dispatcher.handle_any_broadcast(source, message, priority, true);
        }
    }

    pub fn handle_global_untargeted<M: UntargetedMessage>(
        &self,
        message: &mut M,
        bus: &MessageBus,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(globals) = self.globals_for(bus) {
            globals.handle_untargeted(message);
        }
    }

    pub fn handle_global_targeted<M: TargetedMessage>(
        &self,
        target: EntityId,
        message: &mut M,
        bus: &MessageBus,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(globals) = self.globals_for(bus) {
            globals.handle_targeted(target, message);
        }
    }

    pub fn handle_global_broadcast<M: BroadcastMessage>(
        &self,
        source: EntityId,
        message: &mut M,
        bus: &MessageBus,
    ) {
        if !self.is_active() {
            return;
        }
        if let Some(globals) = self.globals_for(bus) {
            globals.handle_broadcast(source, message);
        }
    }
}

// Identity and order delegate entirely to the owner identity.

impl PartialEq for MessageHandler {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner
    }
}

impl Eq for MessageHandler {}

impl PartialOrd for MessageHandler {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageHandler {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.owner.cmp(&other.owner)
    }
}

impl core::hash::Hash for MessageHandler {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
    }
}

impl core::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageHandler")
            .field("owner", &self.owner)
            .field("active", &self.is_active())
            .field("dispatchers", &self.dispatchers.read().len())
            .finish_non_exhaustive()
    }
}
