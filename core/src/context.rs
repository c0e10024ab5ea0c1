//! The per-operation lifecycle state machine.
//!
//! A [`RequestContext`] is created by [`Coordinator::start`](crate::coordinator::Coordinator::start)
//! and becomes inert once it reaches a terminal state. It owns the bus
//! observers subscribe to, drives the caller's callbacks, and replays each of
//! its events onto the contexts it is forwarded to.
//!
//! # States
//!
//! ```text
//!                 ┌──────────► prevented ─────────────────┐
//!                 │                ▲                       │
//! created ──► before_send ──► executing ──► after_send ──┼──► success ──┐
//!    │            │               │                      └──► error ────┼──► complete
//!    └────────────┴───────────────┴──► aborted (emits abort, complete)  │
//!                                                            prevented ─┘
//! ```
//!
//! `complete` and `aborted` are terminal. Any lifecycle call arriving after
//! that (a late transport signal, a second `abort`, a second manual
//! completion) is ignored.
//!
//! # Terminal transition
//!
//! Completing a context walks its whole forwarding tree in this order:
//!
//! 1. mark every node terminal
//! 2. remove every node from its owner's registry sequence
//! 3. emit `complete` (replayed onto every child)
//! 4. emit `operation:all-complete` on each owner whose sequence emptied
//! 5. drop handlers, callbacks and the cancel handle
//!
//! An operation started from a `success` or `complete` handler is therefore
//! registered before step 4 runs for the context that triggered it.

use crate::environment::Clock;
use crate::error::{LifecycleError, Result};
use crate::event_bus::{EventBus, SubscriptionId};
use crate::events::{Lifecycle, LifecycleEvent, LifecycleEventName, Outcome, OwnerEvent, Resolution, TransportError};
use crate::owner::Owner;
use crate::registry::OperationRegistry;
use crate::transport::{CancelHandle, CompletionCallbacks};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique identifier of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Lifecycle state of a [`RequestContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    /// Constructed, start events are being emitted
    Created,
    /// `before-send` observers are running
    BeforeSend,
    /// The transport (or intercept) owns the operation
    Executing,
    /// The transport signalled; `after-send` / `data` observers are running
    AfterSend,
    /// Default or manual success path
    Success,
    /// Default or manual error path
    Error,
    /// `abort()` was called (terminal)
    Aborted,
    /// `preventDefault()` took over; waiting for a manual completion
    Prevented,
    /// Completed (terminal)
    Complete,
}

impl ContextState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::BeforeSend => "before_send",
            Self::Executing => "executing",
            Self::AfterSend => "after_send",
            Self::Success => "success",
            Self::Error => "error",
            Self::Aborted => "aborted",
            Self::Prevented => "prevented",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to build a context.
pub(crate) struct ContextSeed {
    pub kind: String,
    pub owner: Owner,
    pub params: Rc<Value>,
    pub registry: Rc<OperationRegistry>,
    pub clock: Rc<dyn Clock>,
    pub callbacks: Option<Box<dyn CompletionCallbacks>>,
    pub parent: Option<RequestContext>,
}

struct ContextInner {
    id: ContextId,
    kind: String,
    owner: Owner,
    params: Rc<Value>,
    started_at: DateTime<Utc>,
    registry: Rc<OperationRegistry>,
    clock: Rc<dyn Clock>,
    parent: Option<Weak<ContextInner>>,
    depth: usize,
    events: EventBus<LifecycleEvent>,
    state: Cell<ContextState>,
    settled: Cell<bool>,
    finished: Cell<bool>,
    aborted: Cell<bool>,
    default_prevented: Cell<bool>,
    response_override: RefCell<Option<Outcome>>,
    resolution: RefCell<Option<Resolution>>,
    cancel_handle: RefCell<Option<Box<dyn CancelHandle>>>,
    callbacks: RefCell<Option<Box<dyn CompletionCallbacks>>>,
    forward_targets: RefCell<Vec<RequestContext>>,
}

/// Handle to one in-flight (or finished) operation.
///
/// Cloning the handle does not clone the operation.
#[derive(Clone)]
pub struct RequestContext {
    inner: Rc<ContextInner>,
}

impl RequestContext {
    pub(crate) fn new(seed: ContextSeed) -> Self {
        let started_at = seed.clock.now();
        let (parent, depth) = seed.parent.map_or((None, 0), |parent| {
            (Some(Rc::downgrade(&parent.inner)), parent.inner.depth + 1)
        });
        Self {
            inner: Rc::new(ContextInner {
                id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
                kind: seed.kind,
                owner: seed.owner,
                params: seed.params,
                started_at,
                registry: seed.registry,
                clock: seed.clock,
                parent,
                depth,
                events: EventBus::new(),
                state: Cell::new(ContextState::Created),
                settled: Cell::new(false),
                finished: Cell::new(false),
                aborted: Cell::new(false),
                default_prevented: Cell::new(false),
                response_override: RefCell::new(None),
                resolution: RefCell::new(None),
                cancel_handle: RefCell::new(None),
                callbacks: RefCell::new(seed.callbacks),
                forward_targets: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Unique identifier.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Operation kind (`read`, `update`, ... or the `event` override).
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Owner this context is registered against.
    #[must_use]
    pub fn owner(&self) -> &Owner {
        &self.inner.owner
    }

    /// Parameter bag from the request options.
    #[must_use]
    pub fn params(&self) -> &Value {
        &self.inner.params
    }

    pub(crate) fn shared_params(&self) -> Rc<Value> {
        Rc::clone(&self.inner.params)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ContextState {
        self.inner.state.get()
    }

    /// When the context was created, according to the coordinator's clock.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Whether this context mirrors another one through forwarding.
    #[must_use]
    pub fn is_forwarded(&self) -> bool {
        self.inner.parent.is_some()
    }

    /// The context this one was forwarded from, if it is still alive.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Self { inner })
    }

    /// Number of forwarding hops from the originating context.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    /// Whether the terminal transition has happened.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.get()
    }

    /// Whether `abort()` took effect.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.get()
    }

    /// Whether `preventDefault()` was called.
    #[must_use]
    pub fn is_default_prevented(&self) -> bool {
        self.root().inner.default_prevented.get()
    }

    /// Resolution, once complete.
    #[must_use]
    pub fn resolution(&self) -> Option<Resolution> {
        self.inner.resolution.borrow().clone()
    }

    /// Outcome an observer substituted for the transport's, if any.
    #[must_use]
    pub fn response_override(&self) -> Option<Outcome> {
        self.root().inner.response_override.borrow().clone()
    }

    /// Contexts this one is forwarded to, in link order.
    #[must_use]
    pub fn forward_targets(&self) -> Vec<Self> {
        self.inner.forward_targets.borrow().clone()
    }

    /// Whether a transport cancel handle is currently held.
    #[must_use]
    pub fn has_cancel_handle(&self) -> bool {
        self.root().inner.cancel_handle.borrow().is_some()
    }

    /// Subscribe to one lifecycle event.
    ///
    /// Subscribing to a finished context is accepted but the handler is
    /// dropped right away: nothing will be emitted anymore.
    pub fn on(
        &self,
        name: LifecycleEventName,
        handler: impl Fn(&LifecycleEvent) + 'static,
    ) -> SubscriptionId {
        let id = self.inner.events.on(name, handler);
        self.discard_if_finished(id)
    }

    /// Subscribe to every lifecycle event.
    pub fn on_any(&self, handler: impl Fn(&LifecycleEvent) + 'static) -> SubscriptionId {
        let id = self.inner.events.on_any(handler);
        self.discard_if_finished(id)
    }

    fn discard_if_finished(&self, id: SubscriptionId) -> SubscriptionId {
        if self.is_finished() {
            debug!(context = %self.id(), "subscription on finished context discarded");
            self.inner.events.off(id);
        }
        id
    }

    /// Remove a subscription.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.events.off(id)
    }

    /// Replace the transport's outcome before it reaches the caller.
    ///
    /// Meant for `after-send` / `data` observers; the override is consumed
    /// when the default path resolves. On a forwarded context this applies
    /// to the originating context.
    pub fn set_response(&self, outcome: Outcome) {
        let root = self.root();
        if root.is_finished() {
            return;
        }
        *root.inner.response_override.borrow_mut() = Some(outcome);
    }

    /// Shorthand for `set_response(Outcome::Success(data))`.
    pub fn set_data(&self, data: Value) {
        self.set_response(Outcome::Success(data));
    }

    /// Take over completion of the operation.
    ///
    /// Allowed while `before-send` or `after-send` observers run. Prevented
    /// before sending, the transport is never called; prevented after
    /// sending, the caller's callbacks are not run. In both cases exactly one
    /// method of the returned handle must eventually be called. Calling this
    /// again returns an equivalent handle. On a forwarded context this applies
    /// to the originating context.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidState`] outside those two windows.
    pub fn prevent_default(&self) -> Result<CompletionHandle> {
        let root = self.root();
        if !root.ptr_eq(self) {
            return root.prevent_default();
        }
        if self.inner.default_prevented.get() {
            return Ok(CompletionHandle {
                context: self.clone(),
            });
        }
        match self.state() {
            ContextState::BeforeSend | ContextState::AfterSend => {
                self.inner.default_prevented.set(true);
                debug!(context = %self.id(), state = %self.state(), "default prevented");
                Ok(CompletionHandle {
                    context: self.clone(),
                })
            }
            state => {
                warn!(context = %self.id(), %state, "prevent_default outside before-send/after-send");
                Err(LifecycleError::InvalidState {
                    operation: "prevent_default",
                    state,
                })
            }
        }
    }

    /// Cancel the operation.
    ///
    /// Effective in `created`, `before_send` and `executing`; a no-op
    /// otherwise and on repeated calls. Cancels the transport handle when
    /// one is held, or as soon as one is attached, then emits `abort` and
    /// `complete` with [`Resolution::Abort`]. On a forwarded context this
    /// aborts the originating context.
    pub fn abort(&self) {
        let root = self.root();
        if !root.ptr_eq(self) {
            root.abort();
            return;
        }
        if self.is_finished() || self.is_aborted() {
            debug!(context = %self.id(), "abort ignored: already terminal");
            return;
        }
        let state = self.state();
        if !matches!(
            state,
            ContextState::Created | ContextState::BeforeSend | ContextState::Executing
        ) {
            debug!(context = %self.id(), %state, "abort ignored: operation already resolving");
            return;
        }

        for node in self.tree() {
            node.inner.aborted.set(true);
        }
        self.transition_all(ContextState::Aborted);

        let handle = self.inner.cancel_handle.borrow_mut().take();
        if let Some(handle) = handle {
            handle.cancel();
        }

        debug!(context = %self.id(), kind = %self.kind(), owner = %self.owner().id(), "operation aborted");
        self.emit_all(&Lifecycle::Abort);
        self.finish(Resolution::Abort, None);
    }

    /// Hand a transport cancel handle to the context.
    ///
    /// Cancelled immediately when the context was already aborted.
    pub fn attach_cancel_handle(&self, handle: Box<dyn CancelHandle>) {
        let root = self.root();
        if !root.ptr_eq(self) {
            root.attach_cancel_handle(handle);
            return;
        }
        if self.is_aborted() {
            handle.cancel();
            return;
        }
        if self.is_finished() {
            return;
        }
        *self.inner.cancel_handle.borrow_mut() = Some(handle);
    }

    /// Whether both handles refer to the same context.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn root(&self) -> Self {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// This context and every context forwarded from it, parents first.
    fn tree(&self) -> Vec<Self> {
        let mut nodes = vec![self.clone()];
        let mut index = 0;
        while index < nodes.len() {
            let children = nodes[index].forward_targets();
            nodes.extend(children);
            index += 1;
        }
        nodes
    }

    pub(crate) fn tree_contains_owner(&self, owner: &Owner) -> bool {
        self.root().tree().iter().any(|node| node.owner() == owner)
    }

    pub(crate) fn add_forward_target(&self, target: Self) {
        target.inner.state.set(self.state());
        self.inner.forward_targets.borrow_mut().push(target);
    }

    fn transition_all(&self, state: ContextState) {
        trace!(context = %self.id(), from = %self.state(), to = %state, "transition");
        for node in self.tree() {
            node.inner.state.set(state);
        }
    }

    fn emit_all(&self, payload: &Lifecycle) {
        self.inner.events.emit(&LifecycleEvent {
            context: self.clone(),
            payload: payload.clone(),
        });
        for target in self.forward_targets() {
            target.emit_all(payload);
        }
    }

    /// Run `before-send`. Returns whether the transport should be called.
    pub(crate) fn begin(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.transition_all(ContextState::BeforeSend);
        self.emit_all(&Lifecycle::BeforeSend);
        if self.is_finished() {
            return false;
        }
        if self.inner.default_prevented.get() {
            self.transition_all(ContextState::Prevented);
            return false;
        }
        self.transition_all(ContextState::Executing);
        true
    }

    /// Entry point of the wrapped completion slots.
    pub(crate) fn deliver(&self, outcome: Outcome) {
        if self.is_finished() || self.state() != ContextState::Executing {
            debug!(
                context = %self.id(),
                state = %self.state(),
                "transport signal ignored"
            );
            return;
        }

        self.transition_all(ContextState::AfterSend);
        self.emit_all(&Lifecycle::AfterSend {
            outcome: outcome.clone(),
        });
        if let Outcome::Success(data) = &outcome {
            if !self.is_finished() && !self.inner.default_prevented.get() {
                self.emit_all(&Lifecycle::Data { data: data.clone() });
            }
        }

        if self.is_finished() {
            return;
        }
        if self.inner.default_prevented.get() {
            if !self.inner.settled.get() {
                self.transition_all(ContextState::Prevented);
            }
            return;
        }

        let outcome = self
            .inner
            .response_override
            .borrow_mut()
            .take()
            .unwrap_or(outcome);
        self.resolve(outcome);
    }

    /// Success / error path shared by the default flow and manual handles.
    fn resolve(&self, outcome: Outcome) {
        if self.is_finished() || self.inner.settled.replace(true) {
            return;
        }
        let callbacks = self.inner.callbacks.borrow_mut().take();
        match &outcome {
            Outcome::Success(data) => {
                self.transition_all(ContextState::Success);
                if let Some(callbacks) = &callbacks {
                    callbacks.success(self, data);
                }
                self.emit_all(&Lifecycle::Success { data: data.clone() });
            }
            Outcome::Error(error) => {
                self.transition_all(ContextState::Error);
                if let Some(callbacks) = &callbacks {
                    callbacks.error(self, error);
                }
                self.emit_all(&Lifecycle::Error {
                    error: error.clone(),
                });
            }
        }
        drop(callbacks);
        self.finish(outcome.resolution(), Some(outcome));
    }

    fn complete_manually(&self, resolution: Resolution) {
        if self.is_finished() || self.inner.settled.replace(true) {
            return;
        }
        self.finish(resolution, None);
    }

    fn finish(&self, resolution: Resolution, outcome: Option<Outcome>) {
        if self.inner.finished.get() {
            return;
        }
        let tree = self.tree();
        for node in &tree {
            node.inner.finished.set(true);
            if !node.is_aborted() {
                node.inner.state.set(ContextState::Complete);
            }
            *node.inner.resolution.borrow_mut() = Some(resolution.clone());
        }
        for node in &tree {
            node.inner.registry.remove(node.owner(), node);
        }

        self.emit_all(&Lifecycle::Complete {
            resolution: resolution.clone(),
            outcome,
        });

        for node in &tree {
            if node.inner.registry.take_emptied(node.owner()) {
                debug!(owner = %node.owner().id(), label = node.owner().label(), "all operations complete");
                node.owner().emit(&OwnerEvent::AllComplete(node.clone()));
            }
        }

        let elapsed = self.inner.clock.now() - self.inner.started_at;
        debug!(
            context = %self.id(),
            kind = %self.kind(),
            owner = %self.owner().id(),
            %resolution,
            elapsed_ms = elapsed.num_milliseconds(),
            forwarded = tree.len() - 1,
            "operation complete"
        );

        for node in &tree {
            node.release();
        }
    }

    fn release(&self) {
        self.inner.events.clear();
        let callbacks = self.inner.callbacks.borrow_mut().take();
        drop(callbacks);
        let handle = self.inner.cancel_handle.borrow_mut().take();
        drop(handle);
        self.inner.response_override.borrow_mut().take();
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("owner", &self.inner.owner.id())
            .field("state", &self.inner.state.get())
            .field("forwarded", &self.inner.parent.is_some())
            .finish_non_exhaustive()
    }
}

/// Manual completion returned by [`RequestContext::prevent_default`].
///
/// The first call on any clone of the handle wins; later calls are ignored.
#[derive(Clone, Debug)]
pub struct CompletionHandle {
    context: RequestContext,
}

impl CompletionHandle {
    /// Complete through the success path: callback, `success`, `complete`.
    pub fn success(&self, data: Value) {
        self.context.resolve(Outcome::Success(data));
    }

    /// Complete through the error path: callback, `error`, `complete`.
    pub fn error(&self, error: TransportError) {
        self.context.resolve(Outcome::Error(error));
    }

    /// Emit `complete` with any resolution, skipping callbacks.
    pub fn complete(&self, resolution: impl Into<Resolution>) {
        self.context.complete_manually(resolution.into());
    }

    /// `complete("halt")`.
    pub fn halt(&self) {
        self.complete("halt");
    }

    /// The context being completed.
    #[must_use]
    pub const fn context(&self) -> &RequestContext {
        &self.context
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use crate::transport::{Callbacks, Completion, RequestOptions, Transport};
    use serde_json::json;

    #[derive(Clone, Default)]
    struct Parked {
        sent: Rc<RefCell<Vec<Completion>>>,
        cancelled: Rc<Cell<usize>>,
    }

    impl Transport for Parked {
        fn send(&self, _: &RequestContext, completion: Completion) -> Option<Box<dyn CancelHandle>> {
            self.sent.borrow_mut().push(completion);
            let cancelled = Rc::clone(&self.cancelled);
            Some(Box::new(move || cancelled.set(cancelled.get() + 1)))
        }
    }

    fn setup() -> (Parked, Coordinator, Owner) {
        let transport = Parked::default();
        let coordinator = Coordinator::new(transport.clone());
        (transport, coordinator, Owner::new("model"))
    }

    fn record(context: &RequestContext) -> Rc<RefCell<Vec<String>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        context.on_any(move |event| {
            let label = match &event.payload {
                Lifecycle::Complete { resolution, .. } => format!("complete:{resolution}"),
                other => other.name().to_string(),
            };
            sink.borrow_mut().push(label);
        });
        log
    }

    #[test]
    fn default_path_runs_callbacks_before_success() {
        let (transport, coordinator, owner) = setup();
        let order = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&order);
        let callbacks = Callbacks::new().on_success(move |_, data| {
            sink.borrow_mut().push(format!("callback:{data}"));
        });

        let context = coordinator
            .start("read", &owner, RequestOptions::new().with_callbacks(callbacks))
            .unwrap();
        assert_eq!(context.state(), ContextState::Executing);
        assert!(context.has_cancel_handle());

        let sink = Rc::clone(&order);
        context.on(LifecycleEventName::Success, move |_| sink.borrow_mut().push("event".to_owned()));
        let log = record(&context);

        transport.sent.borrow_mut().remove(0).success(json!(1));

        assert_eq!(*order.borrow(), vec!["callback:1", "event"]);
        assert_eq!(*log.borrow(), vec!["after-send", "data", "success", "complete:success"]);
        assert_eq!(context.state(), ContextState::Complete);
        assert!(!context.has_cancel_handle());
        assert_eq!(transport.cancelled.get(), 0);
    }

    #[test]
    fn error_outcome_skips_data() {
        let (transport, coordinator, owner) = setup();
        let context = coordinator.start("read", &owner, RequestOptions::new()).unwrap();
        let log = record(&context);

        transport.sent.borrow_mut().remove(0).error(TransportError::new("nope").with_status(404));

        assert_eq!(*log.borrow(), vec!["after-send", "error", "complete:error"]);
        assert_eq!(context.resolution(), Some(Resolution::Error));
    }

    #[test]
    fn prevented_before_send_never_reaches_the_transport() {
        let (transport, coordinator, owner) = setup();
        let handle = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&handle);
        owner.on(crate::events::OwnerTopic::Operation, move |event| {
            let slot = Rc::clone(&slot);
            event.context().on(LifecycleEventName::BeforeSend, move |event| {
                *slot.borrow_mut() = Some(event.context.prevent_default().unwrap());
            });
        });
        let succeeded = Rc::new(Cell::new(false));
        let flag = Rc::clone(&succeeded);

        let context = coordinator
            .start(
                "read",
                &owner,
                RequestOptions::new().with_callbacks(Callbacks::new().on_success(move |_, _| flag.set(true))),
            )
            .unwrap();

        assert!(transport.sent.borrow().is_empty());
        assert_eq!(context.state(), ContextState::Prevented);
        assert!(context.is_default_prevented());

        let handle = handle.borrow_mut().take().unwrap();
        handle.success(json!("cached"));
        assert!(succeeded.get());
        assert_eq!(context.resolution(), Some(Resolution::Success));

        handle.error(TransportError::new("late"));
        assert_eq!(context.resolution(), Some(Resolution::Success));
    }

    #[test]
    fn prevented_after_send_skips_callbacks_until_manual_completion() {
        let (transport, coordinator, owner) = setup();
        let called = Rc::new(Cell::new(0));
        let counter = Rc::clone(&called);
        let context = coordinator
            .start(
                "read",
                &owner,
                RequestOptions::new()
                    .with_callbacks(Callbacks::new().on_success(move |_, _| counter.set(counter.get() + 1))),
            )
            .unwrap();
        let handle = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&handle);
        context.on(LifecycleEventName::AfterSend, move |event| {
            *slot.borrow_mut() = Some(event.context.prevent_default().unwrap());
        });
        let log = record(&context);

        transport.sent.borrow_mut().remove(0).success(json!(1));
        assert_eq!(context.state(), ContextState::Prevented);
        assert_eq!(called.get(), 0);
        assert_eq!(*log.borrow(), vec!["after-send"]);

        handle.borrow_mut().take().unwrap().halt();
        assert_eq!(called.get(), 0);
        assert_eq!(context.resolution(), Some(Resolution::Custom("halt".to_owned())));
        assert_eq!(*log.borrow(), vec!["after-send", "complete:halt"]);
    }

    #[test]
    fn prevent_default_outside_its_windows_is_rejected() {
        let (_, coordinator, owner) = setup();
        let context = coordinator.start("read", &owner, RequestOptions::new()).unwrap();

        assert_eq!(
            context.prevent_default().unwrap_err(),
            LifecycleError::InvalidState {
                operation: "prevent_default",
                state: ContextState::Executing,
            }
        );
    }

    #[test]
    fn abort_is_idempotent_and_cancels_the_transport() {
        let (transport, coordinator, owner) = setup();
        let context = coordinator.start("read", &owner, RequestOptions::new()).unwrap();
        let log = record(&context);

        context.abort();
        context.abort();

        assert_eq!(transport.cancelled.get(), 1);
        assert_eq!(*log.borrow(), vec!["abort", "complete:abort"]);
        assert_eq!(context.state(), ContextState::Aborted);
        assert!(context.is_finished());
        assert_eq!(coordinator.pending(&owner), 0);

        // The transport reporting after cancellation changes nothing.
        transport.sent.borrow_mut().remove(0).success(json!(1));
        assert_eq!(context.resolution(), Some(Resolution::Abort));
    }

    #[test]
    fn abort_before_send_skips_the_transport() {
        let (transport, coordinator, owner) = setup();
        owner.on(crate::events::OwnerTopic::Operation, |event| event.context().abort());

        let context = coordinator.start("read", &owner, RequestOptions::new()).unwrap();

        assert!(transport.sent.borrow().is_empty());
        assert!(context.is_aborted());
        assert_eq!(context.resolution(), Some(Resolution::Abort));
    }

    #[test]
    fn late_cancel_handle_is_cancelled_immediately() {
        let (_, coordinator, owner) = setup();
        let context = coordinator
            .start("read", &owner, RequestOptions::new().with_intercept(|_| {}))
            .unwrap();
        context.abort();

        let cancelled = Rc::new(Cell::new(false));
        let flag = Rc::clone(&cancelled);
        context.attach_cancel_handle(Box::new(move || flag.set(true)));
        assert!(cancelled.get());
    }

    #[test]
    fn abort_after_the_outcome_is_ignored() {
        let (transport, coordinator, owner) = setup();
        let context = coordinator.start("read", &owner, RequestOptions::new()).unwrap();
        context.on(LifecycleEventName::AfterSend, |event| event.context.abort());

        transport.sent.borrow_mut().remove(0).success(json!(1));

        assert!(!context.is_aborted());
        assert_eq!(context.resolution(), Some(Resolution::Success));
        assert_eq!(transport.cancelled.get(), 0);
    }

    #[test]
    fn subscribing_to_a_finished_context_is_inert() {
        let (_, coordinator, owner) = setup();
        let context = coordinator.start("read", &owner, RequestOptions::new()).unwrap();
        context.abort();

        let id = context.on_any(|_| {});
        assert!(context.inner.events.is_empty());
        assert!(!context.off(id));
    }
}
