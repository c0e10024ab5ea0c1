//! Owners: the entities operations are issued for.
//!
//! An [`Owner`] is a cheap, clonable handle. Two handles are equal only when
//! they point at the same owner; the coordinator never compares owners by
//! value. Each owner carries its own bus of [`OwnerEvent`]s.

use crate::event_bus::{EventBus, SubscriptionId};
use crate::events::{OwnerEvent, OwnerTopic};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an [`Owner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

struct OwnerInner {
    id: OwnerId,
    label: String,
    events: EventBus<OwnerEvent>,
}

/// Shared handle to an owning entity.
#[derive(Clone)]
pub struct Owner {
    inner: Rc<OwnerInner>,
}

impl Owner {
    /// Create a new owner. `label` only shows up in logs and `Debug` output.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(OwnerInner {
                id: OwnerId(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)),
                label: label.into(),
                events: EventBus::new(),
            }),
        }
    }

    /// Identity of this owner.
    #[must_use]
    pub fn id(&self) -> OwnerId {
        self.inner.id
    }

    /// Label given at creation.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Subscribe to owner events matching `topic`.
    pub fn on(&self, topic: OwnerTopic, handler: impl Fn(&OwnerEvent) + 'static) -> SubscriptionId {
        self.inner.events.on(topic, handler)
    }

    /// Subscribe to every owner event.
    pub fn on_any(&self, handler: impl Fn(&OwnerEvent) + 'static) -> SubscriptionId {
        self.inner.events.on_any(handler)
    }

    /// Remove a subscription.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.events.off(id)
    }

    /// Number of subscriptions on this owner's bus.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.events.len()
    }

    pub(crate) fn emit(&self, event: &OwnerEvent) {
        self.inner.events.emit(event);
    }

    /// Non-owning handle, used by long-lived subscriptions.
    #[must_use]
    pub fn downgrade(&self) -> WeakOwner {
        WeakOwner(Rc::downgrade(&self.inner))
    }

    /// Whether both handles refer to the same owner.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Owner {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Owner {}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .finish_non_exhaustive()
    }
}

/// Weak counterpart of [`Owner`].
#[derive(Clone, Debug, Default)]
pub struct WeakOwner(Weak<OwnerInner>);

impl WeakOwner {
    /// Recover the owner if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Owner> {
        self.0.upgrade().map(|inner| Owner { inner })
    }
}
