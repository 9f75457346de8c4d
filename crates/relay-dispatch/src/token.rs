//! Deregistration tokens.
//!
//! A [`Registration`] is the redeemable handle returned by every
//! `register_*` call. It addresses the owning cache by shape, context,
//! priority, and dedup key instead of capturing a live reference into the
//! tables, so revocation is safe at any point: mid-dispatch, after the
//! owning entity's handler was dropped, or repeatedly.

use std::sync::Weak;

use relay_message::EntityId;

use crate::handler::HandlerKey;

/// Address of one registration inside its owner's delivery tables.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RevokeAddr {
    Untargeted {
        post: bool,
        priority: i32,
        key: HandlerKey,
    },
    Targeted {
        target: EntityId,
        post: bool,
        priority: i32,
        key: HandlerKey,
    },
    AnyTargeted {
        post: bool,
        priority: i32,
        key: HandlerKey,
    },
    Broadcast {
        source: EntityId,
        post: bool,
        priority: i32,
        key: HandlerKey,
    },
    AnyBroadcast {
        post: bool,
        priority: i32,
        key: HandlerKey,
    },
    /// The accept-all triple is registered and revoked as one unit.
    GlobalAcceptAll {
        untargeted: HandlerKey,
        targeted: HandlerKey,
        broadcast: HandlerKey,
    },
}

/// Something a token can redeem a revocation against: a typed dispatcher
/// or a global accept-all table set.
pub(crate) trait RevokeTarget: Send + Sync {
    fn revoke(&self, addr: &RevokeAddr);
}

struct RegistrationState {
    owner: Weak<dyn RevokeTarget>,
    addr: RevokeAddr,
    /// Bus-side unsubscription, run exactly once alongside the cache
    /// release so the router's bookkeeping mirrors every register call.
    unsubscribe: Box<dyn FnOnce() + Send>,
}

/// Redeemable handle for one `register_*` call.
///
/// [`revoke`](Self::revoke) drops exactly one registration: for a handler
/// registered n times (same `Arc`, same scope), the nth token's revocation
/// is the one that removes it from dispatch. Revoking twice, or after the
/// owning handler was destroyed, is a safe no-op.
///
/// Dropping a token without revoking intentionally leaves the
/// registration live for the lifetime of its owning handler.
pub struct Registration {
    state: Option<RegistrationState>,
}

impl Registration {
    pub(crate) fn new(
        owner: Weak<dyn RevokeTarget>,
        addr: RevokeAddr,
        unsubscribe: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            state: Some(RegistrationState {
                owner,
                addr,
                unsubscribe,
            }),
        }
    }

    /// Redeem this token: release the cache entry (pruning empty priority
    /// buckets and context scopes) and unsubscribe from the bus.
    pub fn revoke(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };

        if let Some(owner) = state.owner.upgrade() {
            owner.revoke(&state.addr);
        }
        (state.unsubscribe)();
    }

    /// Whether this token was already redeemed.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.state.is_none()
    }
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("revoked", &self.is_revoked())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct CountingTarget {
        revocations: AtomicU32,
    }

    impl RevokeTarget for CountingTarget {
        fn revoke(&self, _addr: &RevokeAddr) {
            self.revocations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addr() -> RevokeAddr {
        let anchor: Arc<u8> = Arc::new(0);
        RevokeAddr::Untargeted {
            post: false,
            priority: 0,
            key: HandlerKey::of(&anchor),
        }
    }

    #[test]
    fn test_revoke_is_exactly_once() {
        let target = Arc::new(CountingTarget {
            revocations: AtomicU32::new(0),
        });
        let unsubscribes = Arc::new(AtomicU32::new(0));

        let u = Arc::clone(&unsubscribes);
        let weak = Arc::downgrade(&target);
        let mut registration = Registration::new(
            weak,
            addr(),
            Box::new(move || {
                u.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(!registration.is_revoked());
        registration.revoke();
        registration.revoke();

        assert!(registration.is_revoked());
        assert_eq!(target.revocations.load(Ordering::SeqCst), 1);
        assert_eq!(unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_revoke_after_owner_dropped_is_noop() {
        let target = Arc::new(CountingTarget {
            revocations: AtomicU32::new(0),
        });
        let weak = Arc::downgrade(&target);
        let mut registration = Registration::new(weak, addr(), Box::new(|| {}));

        drop(target);
        registration.revoke();

        assert!(registration.is_revoked());
    }
}
