//! The `start` entry point and its configuration.
//!
//! A [`Coordinator`] ties together the pieces an operation needs: the
//! transport, the [`OperationRegistry`], the global bus and a clock. All of
//! them can be injected through [`CoordinatorBuilder`], which is how tests get
//! an isolated registry and global bus.
//!
//! # Start sequence
//!
//! 1. resolve the kind (`event` option wins over the `kind` argument)
//! 2. create the context and register it for the owner
//! 3. emit `operation` and `operation:{kind}` on the owner, then on the global bus
//! 4. run `before-send`
//! 5. unless aborted or prevented, call the intercept or the transport
//!
//! The context is returned synchronously in every case.
//!
//! Every announcement of step 3 is emitted even when an earlier observer
//! aborted the context: observers of `operation:{kind}` and of the global bus
//! may then receive a context that is already finished, and should check
//! [`RequestContext::is_finished`] before subscribing to its lifecycle.
//!
//! # Global bus
//!
//! The coordinator model is single-threaded, so the process-wide bus is one
//! instance per thread, created lazily by [`global_bus`]. Coordinators built
//! without an explicit bus share it. Subscribe to it before starting
//! operations you want to observe.

use crate::context::{ContextSeed, RequestContext};
use crate::environment::{Clock, SystemClock};
use crate::error::{LifecycleError, Result};
use crate::event_bus::EventBus;
use crate::events::{OperationEvent, OwnerEvent};
use crate::owner::Owner;
use crate::registry::OperationRegistry;
use crate::transport::{Completion, RequestOptions, Transport};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

thread_local! {
    static GLOBAL_BUS: Rc<EventBus<OperationEvent>> = Rc::new(EventBus::new());
}

/// The calling thread's global operation bus.
#[must_use]
pub fn global_bus() -> Rc<EventBus<OperationEvent>> {
    GLOBAL_BUS.with(Rc::clone)
}

/// Coordinator configuration.
///
/// # Example
///
/// ```
/// use request_lifecycle_core::coordinator::CoordinatorConfig;
///
/// let config = CoordinatorConfig::default()
///     .with_global_events(false)
///     .with_max_forward_depth(2);
/// assert!(!config.global_events);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Publish `operation` events on the global bus
    pub global_events: bool,
    /// Longest forwarding chain (A→B→C is depth 2) before forwarding is skipped
    pub max_forward_depth: usize,
}

impl CoordinatorConfig {
    /// Create a configuration with explicit values.
    #[must_use]
    pub const fn new(global_events: bool, max_forward_depth: usize) -> Self {
        Self {
            global_events,
            max_forward_depth,
        }
    }

    /// Enable or disable global bus events.
    #[must_use]
    pub const fn with_global_events(mut self, enabled: bool) -> Self {
        self.global_events = enabled;
        self
    }

    /// Set the maximum forwarding depth.
    #[must_use]
    pub const fn with_max_forward_depth(mut self, depth: usize) -> Self {
        self.max_forward_depth = depth;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            global_events: true,
            max_forward_depth: 8,
        }
    }
}

pub(crate) struct CoordinatorInner {
    transport: Rc<dyn Transport>,
    registry: Rc<OperationRegistry>,
    global: Rc<EventBus<OperationEvent>>,
    clock: Rc<dyn Clock>,
    config: CoordinatorConfig,
}

/// Starts operations and owns the shared registry.
#[derive(Clone)]
pub struct Coordinator {
    inner: Rc<CoordinatorInner>,
}

impl Coordinator {
    /// Coordinator with default configuration, a fresh registry, the
    /// thread's global bus and the system clock.
    #[must_use]
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::builder(transport).build()
    }

    /// Start building a coordinator around `transport`.
    #[must_use]
    pub fn builder(transport: impl Transport + 'static) -> CoordinatorBuilder {
        CoordinatorBuilder {
            transport: Rc::new(transport),
            registry: None,
            global: None,
            clock: None,
            config: CoordinatorConfig::default(),
        }
    }

    /// Start an operation of `kind` for `owner`.
    ///
    /// Returns the context once the start events and `before-send` have run
    /// and the transport (or intercept) has been called, unless an observer
    /// aborted or prevented the operation first.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::EmptyKind`] when the resolved kind is blank.
    /// Nothing is registered or emitted in that case.
    #[tracing::instrument(skip(self, owner, options), fields(owner = %owner.id()))]
    pub fn start(&self, kind: &str, owner: &Owner, options: RequestOptions) -> Result<RequestContext> {
        let RequestOptions {
            event,
            params,
            callbacks,
            intercept,
        } = options;
        let kind = event.unwrap_or_else(|| kind.to_owned());
        if kind.trim().is_empty() {
            warn!("rejected operation with empty kind");
            return Err(LifecycleError::EmptyKind);
        }

        let context = RequestContext::new(ContextSeed {
            kind,
            owner: owner.clone(),
            params: Rc::new(params),
            registry: Rc::clone(&self.inner.registry),
            clock: Rc::clone(&self.inner.clock),
            callbacks,
            parent: None,
        });
        self.inner.registry.add(owner, context.clone());
        debug!(
            context = %context.id(),
            kind = context.kind(),
            label = owner.label(),
            pending = self.inner.registry.pending_count(owner),
            "operation started"
        );

        owner.emit(&OwnerEvent::Operation(context.clone()));
        owner.emit(&OwnerEvent::KindOperation(context.clone()));
        if self.inner.config.global_events {
            self.inner.global.emit(&OperationEvent::Operation(context.clone()));
            self.inner
                .global
                .emit(&OperationEvent::KindOperation(context.clone()));
        }

        if !context.begin() {
            debug!(context = %context.id(), state = %context.state(), "transport call skipped");
            return Ok(context);
        }

        let completion = Completion::new(context.clone());
        match intercept {
            Some(intercept) => intercept(completion),
            None => {
                if let Some(handle) = self.inner.transport.send(&context, completion) {
                    context.attach_cancel_handle(handle);
                }
            }
        }
        Ok(context)
    }

    /// Create a child of `source` on `destination` and link it.
    ///
    /// Skipped (returns `None`) when the source's operation already finished,
    /// when `destination` already has a context in the operation's tree, or
    /// when the chain would exceed `max_forward_depth`.
    pub(crate) fn forward_to(&self, source: &RequestContext, destination: &Owner) -> Option<RequestContext> {
        let root = source.root();
        if root.is_finished() {
            return None;
        }
        if root.tree_contains_owner(destination) {
            debug!(
                context = %source.id(),
                destination = %destination.id(),
                "forward skipped: destination already mirrors this operation"
            );
            return None;
        }
        if source.depth() + 1 > self.inner.config.max_forward_depth {
            warn!(
                context = %source.id(),
                destination = %destination.id(),
                max_depth = self.inner.config.max_forward_depth,
                "forward skipped: chain too deep"
            );
            return None;
        }

        let child = RequestContext::new(ContextSeed {
            kind: source.kind().to_owned(),
            owner: destination.clone(),
            params: source.shared_params(),
            registry: Rc::clone(&self.inner.registry),
            clock: Rc::clone(&self.inner.clock),
            callbacks: None,
            parent: Some(source.clone()),
        });
        self.inner.registry.add(destination, child.clone());
        source.add_forward_target(child.clone());
        debug!(
            context = %child.id(),
            source = %source.id(),
            destination = %destination.id(),
            "operation forwarded"
        );

        destination.emit(&OwnerEvent::Operation(child.clone()));
        destination.emit(&OwnerEvent::KindOperation(child.clone()));
        Some(child)
    }

    /// Registry of in-flight operations.
    #[must_use]
    pub fn registry(&self) -> &Rc<OperationRegistry> {
        &self.inner.registry
    }

    /// Bus receiving `operation` events from every owner.
    #[must_use]
    pub fn global_events(&self) -> &Rc<EventBus<OperationEvent>> {
        &self.inner.global
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Number of operations in flight for `owner`.
    #[must_use]
    pub fn pending(&self, owner: &Owner) -> usize {
        self.inner.registry.pending_count(owner)
    }

    pub(crate) fn downgrade(&self) -> WeakCoordinator {
        WeakCoordinator(Rc::downgrade(&self.inner))
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.inner.config)
            .field("owners_in_flight", &self.inner.registry.owner_count())
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub(crate) struct WeakCoordinator(Weak<CoordinatorInner>);

impl WeakCoordinator {
    pub(crate) fn upgrade(&self) -> Option<Coordinator> {
        self.0.upgrade().map(|inner| Coordinator { inner })
    }
}

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder {
    transport: Rc<dyn Transport>,
    registry: Option<Rc<OperationRegistry>>,
    global: Option<Rc<EventBus<OperationEvent>>>,
    clock: Option<Rc<dyn Clock>>,
    config: CoordinatorConfig,
}

impl CoordinatorBuilder {
    /// Use an existing registry, e.g. one shared with another coordinator.
    #[must_use]
    pub fn registry(mut self, registry: Rc<OperationRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use `bus` instead of the thread's global bus.
    #[must_use]
    pub fn global_bus(mut self, bus: Rc<EventBus<OperationEvent>>) -> Self {
        self.global = Some(bus);
        self
    }

    /// Use `clock` for context timestamps.
    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Rc::new(clock));
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the coordinator.
    #[must_use]
    pub fn build(self) -> Coordinator {
        Coordinator {
            inner: Rc::new(CoordinatorInner {
                transport: self.transport,
                registry: self.registry.unwrap_or_default(),
                global: self.global.unwrap_or_else(global_bus),
                clock: self.clock.unwrap_or_else(|| Rc::new(SystemClock)),
                config: self.config,
            }),
        }
    }
}

impl fmt::Debug for CoordinatorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
