//! Per-owner fetch status.
//!
//! A [`FetchTracker`] observes the coordinator's global bus for read
//! operations. A read that succeeds marks its owner as fetched and clears any
//! earlier fetch error; a read that fails marks a fetch error. Only
//! operations started on the owner itself count: contexts forwarded onto an
//! owner never reach the global bus.
//!
//! [`FetchTracker::ensure_fetched`] builds on the flags to load an owner at
//! most once: it answers immediately when the owner was fetched, joins a read
//! already in flight, or starts a new one.

use request_lifecycle_core::context::RequestContext;
use request_lifecycle_core::coordinator::Coordinator;
use request_lifecycle_core::error::Result;
use request_lifecycle_core::event_bus::{EventBus, SubscriptionId};
use request_lifecycle_core::events::{
    Lifecycle, LifecycleEventName, OperationEvent, OperationTopic, Resolution, TransportError,
};
use request_lifecycle_core::owner::{Owner, OwnerId};
use request_lifecycle_core::transport::{Callbacks, RequestOptions};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Kind of operation counted as a fetch unless configured otherwise.
pub const DEFAULT_READ_KIND: &str = "read";

/// Fetch flags of one owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStatus {
    /// A read completed successfully since the last reset
    pub fetched: bool,
    /// The latest completed read failed
    pub error: bool,
}

/// How [`FetchTracker::ensure_fetched`] satisfied the request.
#[derive(Debug, Clone)]
pub enum Fetch {
    /// The owner was fetched already; `on_success` ran synchronously
    Ready,
    /// Joined the read already in flight
    Joined(RequestContext),
    /// Started a new read
    Started(RequestContext),
}

type Statuses = Rc<RefCell<HashMap<OwnerId, FetchStatus>>>;

/// Tracks which owners have been fetched.
///
/// Unsubscribes from the global bus when dropped.
#[derive(Debug)]
pub struct FetchTracker {
    coordinator: Coordinator,
    bus: Rc<EventBus<OperationEvent>>,
    subscription: SubscriptionId,
    read_kind: String,
    statuses: Statuses,
}

impl FetchTracker {
    /// Track `read` operations started through `coordinator`.
    #[must_use]
    pub fn install(coordinator: &Coordinator) -> Self {
        Self::install_for_kind(coordinator, DEFAULT_READ_KIND)
    }

    /// Track operations of `read_kind` started through `coordinator`.
    ///
    /// Requires global events to be enabled on the coordinator.
    #[must_use]
    pub fn install_for_kind(coordinator: &Coordinator, read_kind: impl Into<String>) -> Self {
        let read_kind = read_kind.into();
        let statuses: Statuses = Rc::default();
        let bus = Rc::clone(coordinator.global_events());

        let observed = Rc::clone(&statuses);
        let subscription = bus.on(OperationTopic::Kind(read_kind.clone()), move |event| {
            watch(event.context(), &observed);
        });
        debug!(kind = %read_kind, "fetch tracking installed");

        Self {
            coordinator: coordinator.clone(),
            bus,
            subscription,
            read_kind,
            statuses,
        }
    }

    /// Operation kind counted as a fetch.
    #[must_use]
    pub fn read_kind(&self) -> &str {
        &self.read_kind
    }

    /// Flags of `owner`; all `false` for an owner never read.
    #[must_use]
    pub fn status(&self, owner: &Owner) -> FetchStatus {
        self.statuses
            .borrow()
            .get(&owner.id())
            .copied()
            .unwrap_or_default()
    }

    /// Whether a read of `owner` succeeded since the last reset.
    #[must_use]
    pub fn has_been_fetched(&self, owner: &Owner) -> bool {
        self.status(owner).fetched
    }

    /// Whether the latest read of `owner` failed.
    #[must_use]
    pub fn had_fetch_error(&self, owner: &Owner) -> bool {
        self.status(owner).error
    }

    /// Forget everything known about `owner`, e.g. after its data was cleared.
    pub fn reset(&self, owner: &Owner) {
        if self.statuses.borrow_mut().remove(&owner.id()).is_some() {
            debug!(owner = %owner.id(), "fetch status reset");
        }
    }

    /// Make sure `owner` has been fetched.
    ///
    /// Calls `on_success` right away when it has. Otherwise joins the read in
    /// flight for the owner, or starts one, and calls `on_success` or
    /// `on_error` when it finishes. Neither is called when the read is
    /// aborted or completed manually with a custom resolution.
    ///
    /// # Errors
    ///
    /// Propagates the coordinator's error when a new read cannot be started.
    pub fn ensure_fetched(
        &self,
        owner: &Owner,
        on_success: impl FnOnce() + 'static,
        on_error: impl FnOnce(&TransportError) + 'static,
    ) -> Result<Fetch> {
        if self.has_been_fetched(owner) {
            on_success();
            return Ok(Fetch::Ready);
        }

        let on_success = take_once(on_success);
        let on_error = take_once(on_error);

        let in_flight = self
            .coordinator
            .registry()
            .find(owner, |context| context.kind() == self.read_kind && !context.is_forwarded());
        if let Some(context) = in_flight {
            debug!(owner = %owner.id(), context = %context.id(), "joining read in flight");
            context.on(LifecycleEventName::Success, move |_| {
                if let Some(callback) = on_success.borrow_mut().take() {
                    callback();
                }
            });
            context.on(LifecycleEventName::Error, move |event| {
                if let Lifecycle::Error { error } = &event.payload {
                    if let Some(callback) = on_error.borrow_mut().take() {
                        callback(error);
                    }
                }
            });
            return Ok(Fetch::Joined(context));
        }

        // Callbacks run before the success/error events the tracker observes,
        // so they record the flags themselves.
        let statuses = Rc::clone(&self.statuses);
        let failures = Rc::clone(&self.statuses);
        let callbacks = Callbacks::new()
            .on_success(move |context, _| {
                record(&statuses, context.owner(), &Resolution::Success);
                if let Some(callback) = on_success.borrow_mut().take() {
                    callback();
                }
            })
            .on_error(move |context, error| {
                record(&failures, context.owner(), &Resolution::Error);
                if let Some(callback) = on_error.borrow_mut().take() {
                    callback(error);
                }
            });
        let context = self.coordinator.start(
            &self.read_kind,
            owner,
            RequestOptions::new().with_callbacks(callbacks),
        )?;
        Ok(Fetch::Started(context))
    }
}

impl Drop for FetchTracker {
    fn drop(&mut self) {
        self.bus.off(self.subscription);
    }
}

fn take_once<T>(value: T) -> Rc<RefCell<Option<T>>> {
    Rc::new(RefCell::new(Some(value)))
}

fn watch(context: &RequestContext, statuses: &Statuses) {
    let observed = Rc::clone(statuses);
    context.on(LifecycleEventName::Success, move |event| {
        record(&observed, event.context.owner(), &Resolution::Success);
    });
    let observed = Rc::clone(statuses);
    context.on(LifecycleEventName::Error, move |event| {
        record(&observed, event.context.owner(), &Resolution::Error);
    });
}

fn record(statuses: &Statuses, owner: &Owner, resolution: &Resolution) {
    let mut statuses = statuses.borrow_mut();
    match resolution {
        Resolution::Success => {
            let status = statuses.entry(owner.id()).or_default();
            status.fetched = true;
            status.error = false;
        }
        Resolution::Error => statuses.entry(owner.id()).or_default().error = true,
        Resolution::Abort | Resolution::Custom(_) => {}
    }
}
