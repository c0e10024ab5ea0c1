//! Event recording for assertions on emission order.

use request_lifecycle_core::context::RequestContext;
use request_lifecycle_core::events::{Lifecycle, LifecycleEvent, OperationEvent, OwnerEvent};
use request_lifecycle_core::event_bus::EventBus;
use request_lifecycle_core::owner::Owner;
use std::cell::RefCell;
use std::rc::Rc;

/// Collects event labels from any number of buses into one ordered log.
///
/// Labels:
///
/// | Event | Label |
/// |-------|-------|
/// | lifecycle | `before-send`, `data`, `complete:{resolution}`, ... |
/// | owner | `operation`, `operation:{kind}`, `all-complete` |
/// | global | `global:operation`, `global:operation:{kind}` |
///
/// An optional prefix set per attachment tells sources apart.
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    log: Rc<RefCell<Vec<String>>>,
}

impl EventRecorder {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every lifecycle event of `context`.
    pub fn watch_context(&self, context: &RequestContext) {
        self.watch_context_as(context, "");
    }

    /// Record every lifecycle event of `context`, prefixed with `prefix`.
    pub fn watch_context_as(&self, context: &RequestContext, prefix: &str) {
        let log = Rc::clone(&self.log);
        let prefix = prefix.to_owned();
        context.on_any(move |event| {
            log.borrow_mut().push(format!("{prefix}{}", lifecycle_label(event)));
        });
    }

    /// Record every event of `owner`.
    pub fn watch_owner(&self, owner: &Owner) {
        self.watch_owner_as(owner, "");
    }

    /// Record every event of `owner`, prefixed with `prefix`.
    pub fn watch_owner_as(&self, owner: &Owner, prefix: &str) {
        let log = Rc::clone(&self.log);
        let prefix = prefix.to_owned();
        owner.on_any(move |event| {
            log.borrow_mut().push(format!("{prefix}{}", owner_label(event)));
        });
    }

    /// Record every event of a global bus.
    pub fn watch_global(&self, bus: &EventBus<OperationEvent>) {
        let log = Rc::clone(&self.log);
        bus.on_any(move |event| {
            let label = match event {
                OperationEvent::Operation(_) => "global:operation".to_owned(),
                OperationEvent::KindOperation(context) => format!("global:operation:{}", context.kind()),
            };
            log.borrow_mut().push(label);
        });
    }

    /// Append a marker of the test's own, e.g. to delimit phases.
    pub fn mark(&self, label: impl Into<String>) {
        self.log.borrow_mut().push(label.into());
    }

    /// Labels recorded so far.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    /// How many times `label` was recorded.
    #[must_use]
    pub fn count(&self, label: &str) -> usize {
        self.log.borrow().iter().filter(|recorded| *recorded == label).count()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.log.borrow_mut().clear();
    }
}

/// Label of a lifecycle event.
#[must_use]
pub fn lifecycle_label(event: &LifecycleEvent) -> String {
    match &event.payload {
        Lifecycle::Complete { resolution, .. } => format!("complete:{resolution}"),
        payload => payload.name().to_string(),
    }
}

/// Label of an owner event.
#[must_use]
pub fn owner_label(event: &OwnerEvent) -> String {
    match event {
        OwnerEvent::AllComplete(_) => "all-complete".to_owned(),
        other => other.label(),
    }
}
