//! Message marker traits.
//!
//! A message is plain data; the dispatch core only ever passes it through
//! to handlers. The base [`Message`] trait exists so global accept-all
//! handlers can receive any concrete message as a trait object and downcast
//! when they care about a specific type.

use std::any::Any;

/// Base contract for anything deliverable through the dispatch engine.
///
/// Blanket-implemented for every `Any + Send + Sync` type; the opt-in
/// classification markers below decide which delivery tables apply.
pub trait Message: Any + Send + Sync {
    /// Borrow the message as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Mutably borrow the message as `Any` for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send + Sync> Message for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Marker for messages delivered without any context: every registered
/// untargeted handler for the concrete type sees them.
pub trait UntargetedMessage: Message {}

/// Marker for messages aimed at a single target entity.
pub trait TargetedMessage: Message {}

/// Marker for messages broadcast from a source entity.
pub trait BroadcastMessage: Message {}

#[cfg(test)]
mod tests {
    use super::*;

    struct Damage {
        amount: f32,
    }

    impl TargetedMessage for Damage {}

    #[test]
    fn test_any_type_is_a_message() {
        fn assert_message<T: Message>() {}

        assert_message::<Damage>();
        assert_message::<i32>();
        assert_message::<String>();
    }

    #[test]
    fn test_downcast_through_base_contract() {
        let mut msg = Damage { amount: 10.0 };
        let erased: &mut dyn Message = &mut msg;

        let concrete = erased
            .as_any_mut()
            .downcast_mut::<Damage>()
            .expect("type id should match");
        concrete.amount = 5.0;

        assert!((msg.amount - 5.0).abs() < f32::EPSILON);
    }
}
