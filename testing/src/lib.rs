//! # Request Lifecycle Testing
//!
//! Testing utilities for the request lifecycle coordinator.
//!
//! This crate provides:
//! - [`MockTransport`]: parks operations until the test resolves them
//! - [`EventRecorder`]: one ordered log across context, owner and global buses
//! - [`FixedClock`]: deterministic context timestamps
//! - [`properties`]: proptest strategies for operation scripts
//! - [`init_tracing`]: log output for failing tests
//!
//! ## Example
//!
//! ```
//! use request_lifecycle_core::prelude::*;
//! use request_lifecycle_testing::{EventRecorder, MockTransport, test_clock};
//! use serde_json::json;
//!
//! let transport = MockTransport::new();
//! let coordinator = Coordinator::builder(transport.clone()).clock(test_clock()).build();
//! let owner = Owner::new("model");
//! let recorder = EventRecorder::new();
//! recorder.watch_owner(&owner);
//!
//! let context = coordinator.start("read", &owner, RequestOptions::new()).unwrap();
//! recorder.watch_context(&context);
//! transport.succeed(&context, json!({}));
//!
//! assert_eq!(
//!     recorder.labels(),
//!     ["operation", "operation:read", "after-send", "data", "success", "complete:success", "all-complete"]
//! );
//! ```

use chrono::{DateTime, Utc};
use request_lifecycle_core::environment::Clock;

mod mock_transport;
mod recorder;

pub use mock_transport::MockTransport;
pub use recorder::{EventRecorder, lifecycle_label, owner_label};

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use request_lifecycle_testing::mocks::FixedClock;
    /// use request_lifecycle_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// One step of a generated operation script.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Step {
        /// Start an operation of this kind on owner `owner`
        Start {
            /// Index into the test's owners
            owner: usize,
            /// Operation kind
            kind: &'static str,
        },
        /// Resolve the oldest pending operation successfully
        SucceedNext,
        /// Fail the oldest pending operation
        FailNext,
        /// Abort the in-flight operation at this index (modulo the count)
        Abort(usize),
    }

    /// Operation kinds used by generated scripts.
    pub const KINDS: [&str; 4] = ["read", "create", "update", "delete"];

    /// Strategy for an operation kind.
    pub fn kind() -> impl Strategy<Value = &'static str> {
        prop::sample::select(KINDS.to_vec())
    }

    /// Strategy for one script step over `owners` owners.
    pub fn step(owners: usize) -> impl Strategy<Value = Step> {
        prop_oneof![
            3 => (0..owners, kind()).prop_map(|(owner, kind)| Step::Start { owner, kind }),
            2 => Just(Step::SucceedNext),
            1 => Just(Step::FailNext),
            1 => any::<usize>().prop_map(Step::Abort),
        ]
    }

    /// Strategy for a script of up to `max_len` steps over `owners` owners.
    pub fn script(owners: usize, max_len: usize) -> impl Strategy<Value = Vec<Step>> {
        prop::collection::vec(step(owners), 0..max_len)
    }
}

/// Install a `tracing` subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test: only the first call installs anything.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
    tracing::trace!("test tracing initialised");
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
