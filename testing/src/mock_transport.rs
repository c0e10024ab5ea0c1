//! Scriptable transport for driving contexts by hand.

#![allow(clippy::module_name_repetitions)] // MockTransport is the natural name

use request_lifecycle_core::context::{ContextId, RequestContext};
use request_lifecycle_core::events::{Outcome, TransportError};
use request_lifecycle_core::transport::{CancelHandle, Completion, Transport};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

#[derive(Default)]
struct MockState {
    pending: Vec<Completion>,
    sent: Vec<RequestContext>,
    cancelled: HashSet<ContextId>,
    auto_reply: Option<Outcome>,
    error_on_cancel: Option<TransportError>,
}

/// Transport that parks every operation until the test resolves it.
///
/// Clones share state, so a test keeps one clone and hands the other to
/// the coordinator.
///
/// # Example
///
/// ```
/// use request_lifecycle_core::prelude::*;
/// use request_lifecycle_testing::MockTransport;
/// use serde_json::json;
///
/// let transport = MockTransport::new();
/// let coordinator = Coordinator::new(transport.clone());
/// let owner = Owner::new("model");
///
/// let context = coordinator.start("read", &owner, RequestOptions::new()).unwrap();
/// assert_eq!(transport.pending_len(), 1);
///
/// assert!(transport.succeed(&context, json!({ "id": 1 })));
/// assert_eq!(context.resolution(), Some(Resolution::Success));
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    /// Transport parking every operation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport completing every operation synchronously from `send`.
    #[must_use]
    pub fn replying(outcome: Outcome) -> Self {
        let transport = Self::new();
        transport.state.borrow_mut().auto_reply = Some(outcome);
        transport
    }

    /// Report `error` from inside the cancel handle, the way a transport that
    /// fails its pending operation on cancellation does.
    #[must_use]
    pub fn erroring_on_cancel(self, error: TransportError) -> Self {
        self.state.borrow_mut().error_on_cancel = Some(error);
        self
    }

    /// Number of operations sent so far.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.state.borrow().sent.len()
    }

    /// Contexts sent so far, in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<RequestContext> {
        self.state.borrow().sent.clone()
    }

    /// Number of operations waiting to be resolved.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Whether the cancel handle of `context` was invoked.
    #[must_use]
    pub fn was_cancelled(&self, context: &RequestContext) -> bool {
        self.state.borrow().cancelled.contains(&context.id())
    }

    /// Number of cancelled operations.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.state.borrow().cancelled.len()
    }

    /// Resolve the pending operation of `context` with `data`.
    ///
    /// Returns `false` if it is not pending.
    pub fn succeed(&self, context: &RequestContext, data: Value) -> bool {
        let Some(completion) = self.take(context) else {
            return false;
        };
        completion.success(data);
        true
    }

    /// Fail the pending operation of `context`.
    ///
    /// Returns `false` if it is not pending.
    pub fn fail(&self, context: &RequestContext, error: TransportError) -> bool {
        let Some(completion) = self.take(context) else {
            return false;
        };
        completion.error(error);
        true
    }

    /// Resolve the oldest pending operation with `data`.
    pub fn succeed_next(&self, data: Value) -> Option<RequestContext> {
        let completion = self.take_next()?;
        completion.success(data);
        Some(completion.context().clone())
    }

    /// Fail the oldest pending operation.
    pub fn fail_next(&self, error: TransportError) -> Option<RequestContext> {
        let completion = self.take_next()?;
        completion.error(error);
        Some(completion.context().clone())
    }

    fn take(&self, context: &RequestContext) -> Option<Completion> {
        let mut state = self.state.borrow_mut();
        let index = state
            .pending
            .iter()
            .position(|completion| completion.context().ptr_eq(context))?;
        Some(state.pending.remove(index))
    }

    fn take_next(&self) -> Option<Completion> {
        let mut state = self.state.borrow_mut();
        if state.pending.is_empty() {
            return None;
        }
        Some(state.pending.remove(0))
    }
}

impl Transport for MockTransport {
    fn send(&self, context: &RequestContext, completion: Completion) -> Option<Box<dyn CancelHandle>> {
        let auto_reply = {
            let mut state = self.state.borrow_mut();
            state.sent.push(context.clone());
            state.auto_reply.clone()
        };

        if let Some(outcome) = auto_reply {
            match outcome {
                Outcome::Success(data) => completion.success(data),
                Outcome::Error(error) => completion.error(error),
            }
            return None;
        }

        self.state.borrow_mut().pending.push(completion.clone());
        let state = Rc::downgrade(&self.state);
        let id = context.id();
        Some(Box::new(move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            let error = {
                let mut state = state.borrow_mut();
                state.cancelled.insert(id);
                state.pending.retain(|pending| pending.context().id() != id);
                state.error_on_cancel.clone()
            };
            if let Some(error) = error {
                completion.error(error);
            }
        }))
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("MockTransport")
            .field("sent", &state.sent.len())
            .field("pending", &state.pending.len())
            .field("cancelled", &state.cancelled.len())
            .finish()
    }
}
