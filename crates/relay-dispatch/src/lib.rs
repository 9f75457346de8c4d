//! Relay Dispatch
//!
//! Synchronous, in-process publish/subscribe for entity simulations.
//!
//! # Core Concept: Immediate typed delivery
//!
//! Emitters hand a message to a [`MessageBus`]; the bus walks the
//! per-entity [`MessageHandler`]s subscribed to that concrete type, in
//! ascending priority order, invoking every registered handler as a plain
//! function call. After all primary handlers come the global accept-all
//! handlers, then a post-processing pass. Nothing is queued and nothing
//! crosses a thread: when `emit_*` returns, every interested handler has
//! already run.
//!
//! Delivery comes in nine scoped shapes (untargeted, targeted,
//! any-target, sourced broadcast, and any-source, each in a primary and a
//! post-processing variant) plus three global accept-all classifications.
//!
//! # Re-entrancy
//!
//! Handlers routinely register, deregister, and emit from inside their
//! own invocation (entities spawning entities, death triggering drops).
//! Every dispatch iterates an immutable snapshot fetched up front, so
//! mid-pass mutations never corrupt or skip an in-flight iteration; they
//! become visible to the next emission.
//!
//! # Example
//!
//! ```ignore
//! let bus = MessageBus::new();
//! let player = MessageHandler::new(EntityId::new(7));
//! player.set_active(true);
//!
//! let registration = player.register_targeted::<Damage>(
//!     player.owner(),
//!     Arc::new(|damage: &mut Damage| damage.amount *= 0.5),
//!     0,
//!     &bus,
//! );
//!
//! let mut damage = Damage { amount: 10.0 };
//! bus.emit_targeted(player.owner(), &mut damage);
//! assert_eq!(damage.amount, 5.0);
//! ```

mod bus;
mod cache;
mod dispatcher;
mod facade;
mod handler;
mod table;
mod token;

pub use bus::{BusId, MessageBus};
pub use facade::MessageHandler;
pub use handler::{
    AnyContextMessageFn, AnyMessageFn, ContextMessageFn, ContextMessageValueFn, HandlerKey,
    MessageFn, MessageValueFn,
};
pub use relay_message::{
    BroadcastMessage, EntityId, Message, TargetedMessage, UntargetedMessage,
};
pub use token::Registration;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BroadcastMessage, BusId, EntityId, Message, MessageBus, MessageHandler, Registration,
        TargetedMessage, UntargetedMessage,
    };
}
