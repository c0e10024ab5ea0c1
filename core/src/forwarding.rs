//! Mirroring one owner's operations onto other owners.
//!
//! [`ForwardingManager::forward`] subscribes to a source owner's `operation`
//! events. Each matching operation gets a child context on the destination
//! owner: it is registered there, announced with the destination's own
//! `operation` events, and receives every later lifecycle event of the
//! operation it mirrors. The child completes together with its source and
//! counts towards the destination's `all-complete` signal.
//!
//! Subscriptions are keyed by (source, destination, filter). Forwarding the
//! same key twice is a no-op, and stopping the last filter of a pair removes
//! the pair's bookkeeping entirely.
//!
//! ```
//! use request_lifecycle_core::prelude::*;
//!
//! # struct Idle;
//! # impl Transport for Idle {
//! #     fn send(&self, _: &RequestContext, _: Completion) -> Option<Box<dyn CancelHandle>> { None }
//! # }
//! let coordinator = Coordinator::new(Idle);
//! let forwarding = ForwardingManager::new(&coordinator);
//! let list = Owner::new("list");
//! let page = Owner::new("page");
//!
//! forwarding.forward(&list, &page, ForwardFilter::All);
//! let context = coordinator.start("read", &list, RequestOptions::new()).unwrap();
//! assert_eq!(context.forward_targets().len(), 1);
//! assert_eq!(coordinator.pending(&page), 1);
//!
//! forwarding.stop(&list, &page, None);
//! assert!(!forwarding.is_forwarding(&list, &page));
//! ```

use crate::coordinator::{Coordinator, WeakCoordinator};
use crate::event_bus::SubscriptionId;
use crate::events::OwnerTopic;
use crate::owner::{Owner, OwnerId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Which of the source's operations to forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ForwardFilter {
    /// Every operation kind
    All,
    /// Only operations of this kind
    Kind(String),
}

impl From<&str> for ForwardFilter {
    fn from(kind: &str) -> Self {
        Self::Kind(kind.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ForwardKey {
    All,
    Kind(String),
    Scope(u64),
}

impl From<ForwardFilter> for ForwardKey {
    fn from(filter: ForwardFilter) -> Self {
        match filter {
            ForwardFilter::All => Self::All,
            ForwardFilter::Kind(kind) => Self::Kind(kind),
        }
    }
}

type Routes = HashMap<OwnerId, HashMap<OwnerId, HashMap<ForwardKey, SubscriptionId>>>;

/// Owns forwarding subscriptions between owners.
pub struct ForwardingManager {
    coordinator: WeakCoordinator,
    routes: RefCell<Routes>,
    next_scope: Cell<u64>,
}

impl ForwardingManager {
    /// Manager creating child contexts through `coordinator`.
    #[must_use]
    pub fn new(coordinator: &Coordinator) -> Self {
        Self {
            coordinator: coordinator.downgrade(),
            routes: RefCell::new(HashMap::new()),
            next_scope: Cell::new(0),
        }
    }

    /// Forward operations of `source` matching `filter` to `destination`.
    ///
    /// Returns `false` when the same subscription already existed.
    pub fn forward(&self, source: &Owner, destination: &Owner, filter: impl Into<ForwardFilter>) -> bool {
        self.subscribe(source, destination, filter.into().into())
    }

    /// Forward every operation `source` starts while `scope` runs.
    ///
    /// The subscription is removed when `scope` returns or unwinds. Contexts
    /// created during the scope stay linked to their children afterwards.
    pub fn forward_scoped<R>(&self, source: &Owner, destination: &Owner, scope: impl FnOnce() -> R) -> R {
        let key = ForwardKey::Scope(self.next_scope.get());
        self.next_scope.set(self.next_scope.get() + 1);
        self.subscribe(source, destination, key.clone());
        let _guard = ScopeGuard {
            manager: self,
            source,
            destination,
            key: Some(key),
        };
        scope()
    }

    /// Stop forwarding from `source` to `destination`.
    ///
    /// With a filter only that subscription is removed, without one every
    /// subscription of the pair is. Returns the number removed. Children
    /// created earlier are not retracted.
    pub fn stop(&self, source: &Owner, destination: &Owner, filter: Option<ForwardFilter>) -> usize {
        self.unsubscribe(source, destination, filter.map(ForwardKey::from))
    }

    /// Whether any subscription forwards `source` to `destination`.
    #[must_use]
    pub fn is_forwarding(&self, source: &Owner, destination: &Owner) -> bool {
        self.subscription_count(source, destination) > 0
    }

    /// Number of subscriptions forwarding `source` to `destination`.
    #[must_use]
    pub fn subscription_count(&self, source: &Owner, destination: &Owner) -> usize {
        self.routes
            .borrow()
            .get(&source.id())
            .and_then(|destinations| destinations.get(&destination.id()))
            .map_or(0, HashMap::len)
    }

    /// Number of sources with at least one subscription.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.routes.borrow().len()
    }

    fn subscribe(&self, source: &Owner, destination: &Owner, key: ForwardKey) -> bool {
        let exists = self
            .routes
            .borrow()
            .get(&source.id())
            .and_then(|destinations| destinations.get(&destination.id()))
            .is_some_and(|keys| keys.contains_key(&key));
        if exists {
            return false;
        }

        let topic = match &key {
            ForwardKey::Kind(kind) => OwnerTopic::Kind(kind.clone()),
            ForwardKey::All | ForwardKey::Scope(_) => OwnerTopic::Operation,
        };
        let coordinator = self.coordinator.clone();
        let target = destination.downgrade();
        let id = source.on(topic, move |event| {
            let (Some(coordinator), Some(destination)) = (coordinator.upgrade(), target.upgrade()) else {
                return;
            };
            coordinator.forward_to(event.context(), &destination);
        });

        debug!(source = %source.id(), destination = %destination.id(), ?key, "forwarding enabled");
        self.routes
            .borrow_mut()
            .entry(source.id())
            .or_default()
            .entry(destination.id())
            .or_default()
            .insert(key, id);
        true
    }

    fn unsubscribe(&self, source: &Owner, destination: &Owner, key: Option<ForwardKey>) -> usize {
        let removed: Vec<SubscriptionId> = {
            let mut routes = self.routes.borrow_mut();
            let Some(destinations) = routes.get_mut(&source.id()) else {
                return 0;
            };
            let Some(keys) = destinations.get_mut(&destination.id()) else {
                return 0;
            };
            let removed = match key {
                Some(key) => keys.remove(&key).into_iter().collect(),
                None => keys.drain().map(|(_, id)| id).collect(),
            };
            if keys.is_empty() {
                destinations.remove(&destination.id());
            }
            if destinations.is_empty() {
                routes.remove(&source.id());
            }
            removed
        };

        for id in &removed {
            source.off(*id);
        }
        if !removed.is_empty() {
            debug!(
                source = %source.id(),
                destination = %destination.id(),
                removed = removed.len(),
                "forwarding stopped"
            );
        }
        removed.len()
    }
}

impl fmt::Debug for ForwardingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingManager")
            .field("sources", &self.source_count())
            .finish_non_exhaustive()
    }
}

struct ScopeGuard<'a> {
    manager: &'a ForwardingManager,
    source: &'a Owner,
    destination: &'a Owner,
    key: Option<ForwardKey>,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.manager.unsubscribe(self.source, self.destination, Some(key));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::events::{Lifecycle, LifecycleEventName, OwnerTopic};
    use crate::transport::{CancelHandle, Completion, RequestOptions, Transport};
    use serde_json::json;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Parked(Rc<RefCell<Vec<Completion>>>);

    impl Transport for Parked {
        fn send(&self, _: &RequestContext, completion: Completion) -> Option<Box<dyn CancelHandle>> {
            self.0.borrow_mut().push(completion);
            None
        }
    }

    fn setup() -> (Parked, Coordinator, ForwardingManager) {
        let transport = Parked::default();
        let coordinator = Coordinator::new(transport.clone());
        let forwarding = ForwardingManager::new(&coordinator);
        (transport, coordinator, forwarding)
    }

    #[test]
    fn forwarded_child_mirrors_the_source_lifecycle() {
        let (transport, coordinator, forwarding) = setup();
        let source = Owner::new("list");
        let destination = Owner::new("page");
        let seen = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&seen);
        destination.on(OwnerTopic::Operation, move |event| {
            let child = event.context().clone();
            assert!(child.is_forwarded());
            let log = Rc::clone(&log);
            child.on_any(move |event| log.borrow_mut().push(event.name()));
        });

        assert!(forwarding.forward(&source, &destination, ForwardFilter::All));
        coordinator.start("read", &source, RequestOptions::new()).unwrap();
        assert_eq!(coordinator.pending(&destination), 1);

        let completion = transport.0.borrow_mut().remove(0);
        completion.success(json!([1, 2]));

        assert_eq!(
            *seen.borrow(),
            vec![
                LifecycleEventName::BeforeSend,
                LifecycleEventName::AfterSend,
                LifecycleEventName::Data,
                LifecycleEventName::Success,
                LifecycleEventName::Complete,
            ]
        );
        assert_eq!(coordinator.pending(&destination), 0);
    }

    #[test]
    fn forwarding_the_same_key_twice_is_a_no_op() {
        let (_, coordinator, forwarding) = setup();
        let source = Owner::new("a");
        let destination = Owner::new("b");

        assert!(forwarding.forward(&source, &destination, ForwardFilter::All));
        assert!(!forwarding.forward(&source, &destination, ForwardFilter::All));
        assert_eq!(forwarding.subscription_count(&source, &destination), 1);

        let context = coordinator.start("read", &source, RequestOptions::new()).unwrap();
        assert_eq!(context.forward_targets().len(), 1);
    }

    #[test]
    fn kind_filter_only_forwards_that_kind() {
        let (_, coordinator, forwarding) = setup();
        let source = Owner::new("a");
        let destination = Owner::new("b");
        forwarding.forward(&source, &destination, "update");

        let read = coordinator.start("read", &source, RequestOptions::new()).unwrap();
        let update = coordinator.start("update", &source, RequestOptions::new()).unwrap();

        assert!(read.forward_targets().is_empty());
        assert_eq!(update.forward_targets().len(), 1);
        assert_eq!(update.forward_targets()[0].kind(), "update");
    }

    #[test]
    fn overlapping_filters_forward_once() {
        let (_, coordinator, forwarding) = setup();
        let source = Owner::new("a");
        let destination = Owner::new("b");
        forwarding.forward(&source, &destination, ForwardFilter::All);
        forwarding.forward(&source, &destination, "read");

        let context = coordinator.start("read", &source, RequestOptions::new()).unwrap();
        assert_eq!(context.forward_targets().len(), 1);
        assert_eq!(coordinator.pending(&destination), 1);
    }

    #[test]
    fn stop_removes_subscriptions_and_bookkeeping() {
        let (_, coordinator, forwarding) = setup();
        let source = Owner::new("a");
        let destination = Owner::new("b");
        forwarding.forward(&source, &destination, ForwardFilter::All);
        forwarding.forward(&source, &destination, "read");
        assert_eq!(source.subscription_count(), 2);

        assert_eq!(forwarding.stop(&source, &destination, Some("read".into())), 1);
        assert!(forwarding.is_forwarding(&source, &destination));
        assert_eq!(forwarding.stop(&source, &destination, None), 1);
        assert!(!forwarding.is_forwarding(&source, &destination));
        assert_eq!(forwarding.source_count(), 0);
        assert_eq!(source.subscription_count(), 0);
        assert_eq!(forwarding.stop(&source, &destination, None), 0);

        let context = coordinator.start("read", &source, RequestOptions::new()).unwrap();
        assert!(context.forward_targets().is_empty());
    }

    #[test]
    fn scoped_forwarding_ends_with_the_scope() {
        let (_, coordinator, forwarding) = setup();
        let source = Owner::new("a");
        let destination = Owner::new("b");
        forwarding.forward(&source, &destination, ForwardFilter::All);

        let other = Owner::new("c");
        let inside = forwarding.forward_scoped(&source, &other, || {
            coordinator.start("read", &source, RequestOptions::new()).unwrap()
        });
        let outside = coordinator.start("read", &source, RequestOptions::new()).unwrap();

        assert_eq!(inside.forward_targets().len(), 2);
        assert_eq!(outside.forward_targets().len(), 1);
        assert!(!forwarding.is_forwarding(&source, &other));
        assert!(forwarding.is_forwarding(&source, &destination));
    }

    #[test]
    #[allow(clippy::panic)]
    fn scoped_forwarding_ends_when_the_scope_unwinds() {
        let (_, coordinator, forwarding) = setup();
        let source = Owner::new("a");
        let destination = Owner::new("b");

        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            forwarding.forward_scoped(&source, &destination, || {
                coordinator.start("read", &source, RequestOptions::new()).unwrap();
                panic!("scope failed");
            })
        }));

        assert!(unwound.is_err());
        assert!(!forwarding.is_forwarding(&source, &destination));
        assert_eq!(forwarding.source_count(), 0);
        let later = coordinator.start("read", &source, RequestOptions::new()).unwrap();
        assert!(later.forward_targets().is_empty());
    }

    #[test]
    fn cycles_create_each_child_once() {
        let (transport, coordinator, forwarding) = setup();
        let a = Owner::new("a");
        let b = Owner::new("b");
        forwarding.forward(&a, &b, ForwardFilter::All);
        forwarding.forward(&b, &a, ForwardFilter::All);

        let context = coordinator.start("read", &a, RequestOptions::new()).unwrap();
        let children = context.forward_targets();
        assert_eq!(children.len(), 1);
        assert!(children[0].forward_targets().is_empty());
        assert_eq!(coordinator.pending(&a), 1);
        assert_eq!(coordinator.pending(&b), 1);

        let completion = transport.0.borrow_mut().remove(0);
        completion.error(crate::events::TransportError::new("boom"));
        assert_eq!(coordinator.pending(&a), 0);
        assert_eq!(coordinator.pending(&b), 0);
    }

    #[test]
    fn chains_respect_the_depth_limit() {
        let transport = Parked::default();
        let coordinator = Coordinator::builder(transport)
            .config(crate::coordinator::CoordinatorConfig::default().with_max_forward_depth(1))
            .build();
        let forwarding = ForwardingManager::new(&coordinator);
        let a = Owner::new("a");
        let b = Owner::new("b");
        let c = Owner::new("c");
        forwarding.forward(&a, &b, ForwardFilter::All);
        forwarding.forward(&b, &c, ForwardFilter::All);

        let context = coordinator.start("read", &a, RequestOptions::new()).unwrap();
        let child = context.forward_targets()[0].clone();
        assert_eq!(child.depth(), 1);
        assert!(child.forward_targets().is_empty());
        assert_eq!(coordinator.pending(&c), 0);
    }

    #[test]
    fn abort_on_a_child_aborts_the_source() {
        let (_, coordinator, forwarding) = setup();
        let a = Owner::new("a");
        let b = Owner::new("b");
        forwarding.forward(&a, &b, ForwardFilter::All);

        let context = coordinator.start("read", &a, RequestOptions::new()).unwrap();
        let child = context.forward_targets()[0].clone();
        let aborted = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&aborted);
        context.on(LifecycleEventName::Abort, move |event| {
            assert_eq!(event.payload, Lifecycle::Abort);
            *counter.borrow_mut() += 1;
        });

        child.abort();
        assert!(context.is_aborted());
        assert!(child.is_finished());
        assert_eq!(*aborted.borrow(), 1);
    }
}
