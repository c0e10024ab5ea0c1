//! The seam between the coordinator and whatever performs the operation.
//!
//! The coordinator consumes three things from a transport:
//!
//! 1. a call that starts the operation ([`Transport::send`]),
//! 2. two completion slots it wraps ([`Completion::success`] / [`Completion::error`]),
//! 3. an optional [`CancelHandle`] used by `abort()`.
//!
//! Callers never hand their callbacks to the transport directly. They pass a
//! [`CompletionCallbacks`] implementation in [`RequestOptions`]; the
//! coordinator keeps it and gives the transport a [`Completion`] that drives
//! the request context and, on the default path, calls the caller's callbacks.
//! The options are never mutated.
//!
//! # Example
//!
//! ```
//! use request_lifecycle_core::prelude::*;
//! use serde_json::json;
//!
//! struct Echo;
//!
//! impl Transport for Echo {
//!     fn send(&self, context: &RequestContext, completion: Completion) -> Option<Box<dyn CancelHandle>> {
//!         completion.success(context.params().clone());
//!         None
//!     }
//! }
//!
//! let coordinator = Coordinator::new(Echo);
//! let owner = Owner::new("user");
//! let context = coordinator
//!     .start("read", &owner, RequestOptions::new().with_params(json!({"id": 1})))
//!     .unwrap();
//! assert!(context.is_finished());
//! ```

use crate::context::RequestContext;
use crate::events::{Outcome, TransportError};
use serde_json::Value;
use std::fmt;

/// Cancels an operation that is in flight.
pub trait CancelHandle {
    /// Request cancellation. Best effort: the transport may still report a
    /// completion, which the context ignores once aborted.
    fn cancel(&self);
}

impl<F: Fn()> CancelHandle for F {
    fn cancel(&self) {
        self();
    }
}

/// Performs operations on behalf of the coordinator.
pub trait Transport {
    /// Issue the operation described by `context`.
    ///
    /// The transport must eventually call exactly one of
    /// [`Completion::success`] or [`Completion::error`], synchronously or
    /// later. It may return a handle used to cancel the operation, or attach
    /// one later with [`Completion::attach_cancel_handle`].
    fn send(&self, context: &RequestContext, completion: Completion) -> Option<Box<dyn CancelHandle>>;
}

/// Caller-side completion callbacks.
pub trait CompletionCallbacks {
    /// Called on the default success path, before the `success` event.
    fn success(&self, context: &RequestContext, data: &Value);

    /// Called on the default error path, before the `error` event.
    fn error(&self, context: &RequestContext, error: &TransportError);
}

type SuccessFn = Box<dyn Fn(&RequestContext, &Value)>;
type ErrorFn = Box<dyn Fn(&RequestContext, &TransportError)>;

/// [`CompletionCallbacks`] built from closures. Missing slots do nothing.
#[derive(Default)]
pub struct Callbacks {
    on_success: Option<SuccessFn>,
    on_error: Option<ErrorFn>,
}

impl Callbacks {
    /// Empty callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the success callback.
    #[must_use]
    pub fn on_success(mut self, callback: impl Fn(&RequestContext, &Value) + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Set the error callback.
    #[must_use]
    pub fn on_error(
        mut self,
        callback: impl Fn(&RequestContext, &TransportError) + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }
}

impl CompletionCallbacks for Callbacks {
    fn success(&self, context: &RequestContext, data: &Value) {
        if let Some(callback) = &self.on_success {
            callback(context, data);
        }
    }

    fn error(&self, context: &RequestContext, error: &TransportError) {
        if let Some(callback) = &self.on_error {
            callback(context, error);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Replaces the transport call. Must drive one of the completion's methods.
pub type Intercept = Box<dyn FnOnce(Completion)>;

/// Per-call options.
#[derive(Default)]
pub struct RequestOptions {
    /// Overrides the operation kind given to `start`
    pub event: Option<String>,
    /// Parameter bag handed to the transport, shared with forwarded contexts
    pub params: Value,
    /// Caller callbacks for the default completion path
    pub callbacks: Option<Box<dyn CompletionCallbacks>>,
    /// When set, called instead of the transport
    pub intercept: Option<Intercept>,
}

impl RequestOptions {
    /// Options with no parameters, callbacks or interception.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the operation kind.
    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Set the parameter bag.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Set the caller callbacks.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: impl CompletionCallbacks + 'static) -> Self {
        self.callbacks = Some(Box::new(callbacks));
        self
    }

    /// Replace the transport call with `intercept`.
    #[must_use]
    pub fn with_intercept(mut self, intercept: impl FnOnce(Completion) + 'static) -> Self {
        self.intercept = Some(Box::new(intercept));
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("event", &self.event)
            .field("params", &self.params)
            .field("callbacks", &self.callbacks.is_some())
            .field("intercept", &self.intercept.is_some())
            .finish()
    }
}

/// The wrapped completion slots handed to a transport or intercept.
///
/// Signals arriving after the context left `executing` (it was aborted, or
/// already completed) are ignored.
#[derive(Clone, Debug)]
pub struct Completion {
    context: RequestContext,
}

impl Completion {
    pub(crate) const fn new(context: RequestContext) -> Self {
        Self { context }
    }

    /// Report success with `data`.
    pub fn success(&self, data: Value) {
        self.context.deliver(Outcome::Success(data));
    }

    /// Report failure.
    pub fn error(&self, error: TransportError) {
        self.context.deliver(Outcome::Error(error));
    }

    /// Attach a cancel handle after `send` returned.
    ///
    /// If the context was aborted already the handle is cancelled right away.
    pub fn attach_cancel_handle(&self, handle: Box<dyn CancelHandle>) {
        self.context.attach_cancel_handle(handle);
    }

    /// The context this completion drives.
    #[must_use]
    pub const fn context(&self) -> &RequestContext {
        &self.context
    }
}
