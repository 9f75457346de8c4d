//! Identity and message contracts for the relay dispatch engine.
//!
//! This crate holds the two things the dispatch core treats as external:
//! the opaque [`EntityId`] identity used as facade owner and as the
//! target/source context key, and the message marker traits that classify
//! a value as untargeted, targeted, or broadcast.
//!
//! The dispatch core never inspects message contents; the markers are pure
//! static type tags selecting which delivery tables apply.

mod id;
mod message;

pub use id::EntityId;
pub use message::{BroadcastMessage, Message, TargetedMessage, UntargetedMessage};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{BroadcastMessage, EntityId, Message, TargetedMessage, UntargetedMessage};
}
