//! Typed publish/subscribe primitive.
//!
//! An [`EventBus`] delivers events of a single type to handlers in subscription
//! order. Each event type declares the topics it can be filtered by through the
//! [`BusEvent`] trait, so a subscriber for `complete` on a request context never
//! sees an `abort` payload and the compiler knows the payload shape of every
//! handler.
//!
//! The bus is used in three places:
//!
//! - per [`RequestContext`](crate::context::RequestContext) for lifecycle events
//! - per [`Owner`](crate::owner::Owner) for `operation` / `all-complete` events
//! - as the per-thread global bus returned by [`global_bus`](crate::coordinator::global_bus)
//!
//! # Reentrancy
//!
//! Handlers run synchronously inside [`EventBus::emit`]. The subscriber list is
//! snapshotted when emission starts and no borrow is held while a handler runs,
//! so handlers may subscribe, unsubscribe or emit on the same bus. Handlers added
//! during an emission are not called for that emission.
//!
//! # Example
//!
//! ```
//! use request_lifecycle_core::event_bus::{BusEvent, EventBus};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! #[derive(Debug)]
//! enum Door {
//!     Opened,
//!     Closed,
//! }
//!
//! #[derive(Debug, PartialEq, Eq)]
//! enum DoorTopic {
//!     Opened,
//!     Closed,
//! }
//!
//! impl BusEvent for Door {
//!     type Topic = DoorTopic;
//!
//!     fn matches(&self, topic: &DoorTopic) -> bool {
//!         matches!(
//!             (self, topic),
//!             (Door::Opened, DoorTopic::Opened) | (Door::Closed, DoorTopic::Closed)
//!         )
//!     }
//! }
//!
//! let bus: EventBus<Door> = EventBus::new();
//! let opened = Rc::new(Cell::new(0));
//! let counter = Rc::clone(&opened);
//! bus.on(DoorTopic::Opened, move |_| counter.set(counter.get() + 1));
//!
//! bus.emit(&Door::Opened);
//! bus.emit(&Door::Closed);
//! assert_eq!(opened.get(), 1);
//! ```

use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// An event type that can travel on an [`EventBus`].
pub trait BusEvent {
    /// Filter a subscriber can register for.
    type Topic: fmt::Debug;

    /// Whether this event should be delivered to a subscriber of `topic`.
    fn matches(&self, topic: &Self::Topic) -> bool;
}

/// Identifies a subscription so it can be removed with [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Handler<E> = Rc<dyn Fn(&E)>;

struct Subscription<E: BusEvent> {
    id: SubscriptionId,
    topic: Option<E::Topic>,
    handler: Handler<E>,
}

/// Synchronous, single-threaded publish/subscribe bus.
pub struct EventBus<E: BusEvent> {
    next_id: Cell<u64>,
    subscriptions: RefCell<Vec<Subscription<E>>>,
}

impl<E: BusEvent> EventBus<E> {
    /// Create an empty bus.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: Cell::new(0),
            subscriptions: RefCell::new(Vec::new()),
        }
    }

    /// Subscribe `handler` to events matching `topic`.
    pub fn on(&self, topic: E::Topic, handler: impl Fn(&E) + 'static) -> SubscriptionId {
        self.insert(Some(topic), Rc::new(handler))
    }

    /// Subscribe `handler` to every event on this bus.
    pub fn on_any(&self, handler: impl Fn(&E) + 'static) -> SubscriptionId {
        self.insert(None, Rc::new(handler))
    }

    fn insert(&self, topic: Option<E::Topic>, handler: Handler<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        self.subscriptions.borrow_mut().push(Subscription { id, topic, handler });
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.borrow_mut();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() != before
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        // Handlers may own values whose Drop touches this bus; release them
        // after the borrow ends.
        let dropped = std::mem::take(&mut *self.subscriptions.borrow_mut());
        drop(dropped);
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.borrow().len()
    }

    /// Whether the bus has no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.borrow().is_empty()
    }

    /// Deliver `event` to every matching subscriber in subscription order.
    ///
    /// Returns the number of handlers invoked.
    pub fn emit(&self, event: &E) -> usize {
        let handlers: SmallVec<[Handler<E>; 4]> = self
            .subscriptions
            .borrow()
            .iter()
            .filter(|subscription| {
                subscription
                    .topic
                    .as_ref()
                    .is_none_or(|topic| event.matches(topic))
            })
            .map(|subscription| Rc::clone(&subscription.handler))
            .collect();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.len())
            .finish()
    }
}
