//! Per-owner record of in-flight operations.
//!
//! The [`OperationRegistry`] is the only shared mutable state of the
//! coordinator. It maps an owner to the contexts currently in flight for it,
//! in start order, and remembers when an owner's sequence has just become
//! empty so the `operation:all-complete` signal fires exactly once per
//! emptying.
//!
//! Observers get read-only access ([`active`](OperationRegistry::active),
//! [`find`](OperationRegistry::find), ...), which is enough for an outer layer
//! to detect a duplicate in-flight operation and join it instead of starting
//! a new one.

use crate::context::RequestContext;
use crate::owner::{Owner, OwnerId};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

/// In-flight contexts keyed by owner identity.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    active: RefCell<HashMap<OwnerId, Vec<RequestContext>>>,
    emptied: RefCell<HashSet<OwnerId>>,
}

impl OperationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `context` to `owner`'s sequence.
    ///
    /// Any pending emptied transition for the owner is cancelled: the owner is
    /// busy again.
    pub(crate) fn add(&self, owner: &Owner, context: RequestContext) {
        self.active
            .borrow_mut()
            .entry(owner.id())
            .or_default()
            .push(context);
        self.emptied.borrow_mut().remove(&owner.id());
    }

    /// Remove `context` from `owner`'s sequence.
    ///
    /// Returns `true` when this removal emptied the sequence. Removing a
    /// context that is not registered is a no-op returning `false`.
    pub(crate) fn remove(&self, owner: &Owner, context: &RequestContext) -> bool {
        let mut active = self.active.borrow_mut();
        let Some(contexts) = active.get_mut(&owner.id()) else {
            return false;
        };
        let before = contexts.len();
        contexts.retain(|candidate| !candidate.ptr_eq(context));
        if contexts.len() == before || !contexts.is_empty() {
            return false;
        }
        active.remove(&owner.id());
        self.emptied.borrow_mut().insert(owner.id());
        true
    }

    /// Consume the pending emptied transition for `owner`.
    ///
    /// Returns `true` at most once per emptying, and never while the owner
    /// has operations in flight.
    pub(crate) fn take_emptied(&self, owner: &Owner) -> bool {
        if self.active.borrow().contains_key(&owner.id()) {
            return false;
        }
        self.emptied.borrow_mut().remove(&owner.id())
    }

    /// Snapshot of `owner`'s in-flight contexts in start order.
    #[must_use]
    pub fn active(&self, owner: &Owner) -> Vec<RequestContext> {
        self.active
            .borrow()
            .get(&owner.id())
            .cloned()
            .unwrap_or_default()
    }

    /// Number of operations in flight for `owner`.
    #[must_use]
    pub fn pending_count(&self, owner: &Owner) -> usize {
        self.active.borrow().get(&owner.id()).map_or(0, Vec::len)
    }

    /// Whether `owner` has anything in flight.
    #[must_use]
    pub fn is_active(&self, owner: &Owner) -> bool {
        self.active.borrow().contains_key(&owner.id())
    }

    /// First in-flight context of `owner` satisfying `predicate`.
    ///
    /// The predicate runs on a snapshot, so it may call back into the
    /// coordinator.
    pub fn find(
        &self,
        owner: &Owner,
        predicate: impl Fn(&RequestContext) -> bool,
    ) -> Option<RequestContext> {
        self.active(owner).into_iter().find(|context| predicate(context))
    }

    /// Number of owners with operations in flight.
    #[must_use]
    pub fn owner_count(&self) -> usize {
        self.active.borrow().len()
    }
}
