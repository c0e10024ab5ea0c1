//! # Request Lifecycle Core
//!
//! Coordinates the lifecycle of asynchronous operations started on behalf of
//! domain objects ("owners").
//!
//! Every operation gets a [`RequestContext`](context::RequestContext) that
//! moves through a fixed state machine and emits lifecycle events observers
//! can subscribe to. Observers may abort the operation, take over its
//! completion, or replace the response before the caller sees it. Owners
//! announce the operations they start, report when they have nothing in
//! flight anymore, and can mirror their operations onto other owners.
//!
//! ## Building blocks
//!
//! - [`event_bus`]: typed, synchronous publish/subscribe
//! - [`registry`]: per-owner record of in-flight operations
//! - [`context`]: the per-operation state machine
//! - [`coordinator`]: the `start` entry point, configuration and global bus
//! - [`forwarding`]: mirroring operations between owners
//! - [`transport`]: the seam to whatever performs the operation
//! - [`events`]: event payloads shared by all of the above
//!
//! ## Threading
//!
//! The coordinator is single-threaded: handles are `Rc`-based and every
//! event is delivered synchronously on the thread that triggered it.
//! Handlers may re-enter the coordinator (start operations, abort,
//! subscribe) while an event is being delivered.
//!
//! ## Example
//!
//! ```
//! use request_lifecycle_core::prelude::*;
//! use serde_json::json;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! #[derive(Clone, Default)]
//! struct Parked(Rc<RefCell<Vec<Completion>>>);
//!
//! impl Transport for Parked {
//!     fn send(&self, _: &RequestContext, completion: Completion) -> Option<Box<dyn CancelHandle>> {
//!         self.0.borrow_mut().push(completion);
//!         None
//!     }
//! }
//!
//! let transport = Parked::default();
//! let coordinator = Coordinator::new(transport.clone());
//! let user = Owner::new("user");
//!
//! user.on(OwnerTopic::Kind("read".into()), |event| {
//!     event.context().on(LifecycleEventName::Data, |event| {
//!         if let Lifecycle::Data { data } = &event.payload {
//!             event.context.set_data(json!({ "name": data["name"], "cached": true }));
//!         }
//!     });
//! });
//!
//! let context = coordinator.start("read", &user, RequestOptions::new()).unwrap();
//! assert_eq!(context.state(), ContextState::Executing);
//!
//! let completion = transport.0.borrow_mut().remove(0);
//! completion.success(json!({ "name": "ada" }));
//! assert_eq!(context.resolution(), Some(Resolution::Success));
//! assert_eq!(coordinator.pending(&user), 0);
//! ```

pub mod context;
pub mod coordinator;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod forwarding;
pub mod owner;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde_json::Value;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time for testability
    ///
    /// Contexts record their start time and the coordinator reports elapsed
    /// time on completion; tests inject a fixed clock to keep both stable.
    pub trait Clock {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

/// Everything needed to start and observe operations.
pub mod prelude {
    pub use crate::context::{CompletionHandle, ContextId, ContextState, RequestContext};
    pub use crate::coordinator::{Coordinator, CoordinatorBuilder, CoordinatorConfig, global_bus};
    pub use crate::environment::{Clock, SystemClock};
    pub use crate::error::LifecycleError;
    pub use crate::event_bus::{BusEvent, EventBus, SubscriptionId};
    pub use crate::events::{
        Lifecycle, LifecycleEvent, LifecycleEventName, OperationEvent, OperationTopic, Outcome,
        OwnerEvent, OwnerTopic, Resolution, TransportError,
    };
    pub use crate::forwarding::{ForwardFilter, ForwardingManager};
    pub use crate::owner::{Owner, OwnerId, WeakOwner};
    pub use crate::registry::OperationRegistry;
    pub use crate::transport::{
        Callbacks, CancelHandle, Completion, CompletionCallbacks, Intercept, RequestOptions,
        Transport,
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        assert!(clock.now() >= first);
    }
}
