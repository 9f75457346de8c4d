//! Handler callable shapes and the deduplication key.
//!
//! Handlers come in two interchangeable shapes: by-reference (the fast
//! path, `Fn(&mut M)`) and by-value (`Fn(M)`, which costs one clone per
//! invocation). Both are registered as plain `Arc`'d closures; the `Arc`'s
//! data address is the deduplication key, so registering a clone of the
//! same `Arc` twice collapses into one ref-counted entry.

use std::sync::Arc;

use relay_message::{EntityId, Message};

/// By-reference handler: receives the message by mutable reference, so
/// in-place edits are visible to later handlers in the same pass and to
/// the emitter after dispatch returns.
pub type MessageFn<M> = dyn Fn(&mut M) + Send + Sync;

/// By-value handler: receives its own clone of the message.
pub type MessageValueFn<M> = dyn Fn(M) + Send + Sync;

/// By-reference handler that also receives the context identity (the
/// target for any-target registrations, the source for any-source ones).
pub type ContextMessageFn<M> = dyn Fn(EntityId, &mut M) + Send + Sync;

/// By-value variant of [`ContextMessageFn`].
pub type ContextMessageValueFn<M> = dyn Fn(EntityId, M) + Send + Sync;

/// Global accept-all handler: fires for every concrete message of its
/// classification, receiving the type-erased message.
pub type AnyMessageFn = dyn Fn(&mut dyn Message) + Send + Sync;

/// Global accept-all handler for targeted/broadcast classifications;
/// receives the target or source alongside the message.
pub type AnyContextMessageFn = dyn Fn(EntityId, &mut dyn Message) + Send + Sync;

/// Deduplication key for a registered handler.
///
/// The address of the caller-supplied `Arc`'s data, never of a wrapping
/// adapter, so duplicate registrations of the same handler are detected
/// regardless of which shape adapter ends up stored as the active
/// callable. The keyed allocation is kept alive by the cache entry (the
/// active callable is either the same `Arc` or a closure owning it), so
/// an address is never reused while its entry exists.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey(usize);

impl HandlerKey {
    /// Key an `Arc`'d handler by its data address.
    #[must_use]
    pub fn of<T: ?Sized>(handler: &Arc<T>) -> Self {
        Self(Arc::as_ptr(handler).cast::<()>() as usize)
    }
}

impl core::fmt::Debug for HandlerKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HandlerKey({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_stable_across_clones() {
        let handler: Arc<MessageFn<i32>> = Arc::new(|_| {});
        let clone = Arc::clone(&handler);

        assert_eq!(HandlerKey::of(&handler), HandlerKey::of(&clone));
    }

    #[test]
    fn test_distinct_handlers_have_distinct_keys() {
        let a: Arc<MessageFn<i32>> = Arc::new(|_| {});
        let b: Arc<MessageFn<i32>> = Arc::new(|_| {});

        assert_ne!(HandlerKey::of(&a), HandlerKey::of(&b));
    }
}
