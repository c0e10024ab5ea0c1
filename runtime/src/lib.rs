//! # Request Lifecycle Runtime
//!
//! Async plumbing around the lifecycle coordinator.
//!
//! ## Components
//!
//! - **`FutureTransport`**: runs each operation as a future on the current
//!   thread's `LocalSet`; aborting the context aborts the task
//! - **`FetchTracker`**: per-owner "has been fetched" / "had fetch error"
//!   flags and `ensure_fetched`
//! - **Metrics**: counters, gauge and histogram fed from the global bus
//!
//! ## Example
//!
//! ```
//! use request_lifecycle_core::prelude::*;
//! use request_lifecycle_runtime::FutureTransport;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let local = tokio::task::LocalSet::new();
//! local
//!     .run_until(async {
//!         let transport = FutureTransport::new(|context: &RequestContext| {
//!             let id = context.params()["id"].clone();
//!             Box::pin(async move { Ok::<_, TransportError>(json!({ "id": id, "name": "ada" })) })
//!         });
//!         let coordinator = Coordinator::new(transport);
//!         let user = Owner::new("user");
//!
//!         let context = coordinator
//!             .start("read", &user, RequestOptions::new().with_params(json!({ "id": 1 })))
//!             .unwrap();
//!         assert_eq!(context.state(), ContextState::Executing);
//!
//!         while !context.is_finished() {
//!             tokio::task::yield_now().await;
//!         }
//!         assert_eq!(context.resolution(), Some(Resolution::Success));
//!     })
//!     .await;
//! # }
//! ```

use futures::future::LocalBoxFuture;
use request_lifecycle_core::context::RequestContext;
use request_lifecycle_core::events::TransportError;
use request_lifecycle_core::transport::{CancelHandle, Completion, Transport};
use serde_json::Value;
use std::time::Duration;
use tracing::Instrument;

/// Per-owner fetch status and `ensure_fetched`
pub mod fetch;

/// Metrics for observability
pub mod metrics;

pub use fetch::{Fetch, FetchStatus, FetchTracker};
pub use metrics::LifecycleMetrics;

/// Future an operation resolves through.
pub type OperationFuture = LocalBoxFuture<'static, Result<Value, TransportError>>;

/// Configuration for [`FutureTransport`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    /// Fail operations still pending after this long
    pub timeout: Option<Duration>,
}

impl TransportConfig {
    /// Create a new configuration without a timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self { timeout: None }
    }

    /// Set the operation timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Transport running each operation as a local task.
///
/// The factory is called synchronously from `send` with the context; the
/// returned future is spawned with [`tokio::task::spawn_local`] and its
/// result drives the completion. The cancel handle aborts the task, so an
/// aborted operation never reports back.
pub struct FutureTransport<F> {
    factory: F,
    config: TransportConfig,
}

impl<F> FutureTransport<F>
where
    F: Fn(&RequestContext) -> OperationFuture,
{
    /// Create a transport from an operation factory.
    #[must_use]
    pub const fn new(factory: F) -> Self {
        Self {
            factory,
            config: TransportConfig::new(),
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl<F> Transport for FutureTransport<F>
where
    F: Fn(&RequestContext) -> OperationFuture,
{
    /// # Panics
    ///
    /// Panics when called outside a [`tokio::task::LocalSet`].
    fn send(&self, context: &RequestContext, completion: Completion) -> Option<Box<dyn CancelHandle>> {
        let operation = (self.factory)(context);
        let timeout = self.config.timeout;
        let span = tracing::debug_span!("operation", context = %context.id(), kind = context.kind());

        let task = tokio::task::spawn_local(
            async move {
                let result = match timeout {
                    Some(limit) => tokio::time::timeout(limit, operation)
                        .await
                        .unwrap_or_else(|_| {
                            tracing::debug!(?limit, "operation timed out");
                            Err(TransportError::new(format!("timed out after {limit:?}")))
                        }),
                    None => operation.await,
                };
                match result {
                    Ok(data) => completion.success(data),
                    Err(error) => completion.error(error),
                }
            }
            .instrument(span),
        );

        let abort = task.abort_handle();
        Some(Box::new(move || abort.abort()))
    }
}

impl<F> std::fmt::Debug for FutureTransport<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
