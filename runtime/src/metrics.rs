//! Operation metrics.
//!
//! [`LifecycleMetrics`] observes a coordinator's global bus and records:
//!
//! - `lifecycle_operations_started_total{kind}`
//! - `lifecycle_operations_completed_total{kind, resolution}`
//! - `lifecycle_operations_in_flight`
//! - `lifecycle_operation_duration_seconds{kind}`
//!
//! Metrics go to whatever `metrics` recorder is installed. [`PrometheusMetrics`]
//! installs a Prometheus recorder with latency buckets suited to the duration
//! histogram.
//!
//! # Example
//!
//! ```rust,no_run
//! use request_lifecycle_runtime::metrics::{LifecycleMetrics, PrometheusMetrics};
//! # use request_lifecycle_core::prelude::*;
//! # struct Idle;
//! # impl Transport for Idle {
//! #     fn send(&self, _: &RequestContext, _: Completion) -> Option<Box<dyn CancelHandle>> { None }
//! # }
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let prometheus = PrometheusMetrics::install()?;
//! let coordinator = Coordinator::new(Idle);
//! let _metrics = LifecycleMetrics::install(&coordinator);
//!
//! // ... start operations ...
//! if let Some(rendered) = prometheus.render() {
//!     println!("{rendered}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use request_lifecycle_core::context::RequestContext;
use request_lifecycle_core::coordinator::Coordinator;
use request_lifecycle_core::event_bus::{EventBus, SubscriptionId};
use request_lifecycle_core::events::{Lifecycle, LifecycleEventName, OperationEvent, OperationTopic, Resolution};
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

const STARTED: &str = "lifecycle_operations_started_total";
const COMPLETED: &str = "lifecycle_operations_completed_total";
const IN_FLIGHT: &str = "lifecycle_operations_in_flight";
const DURATION: &str = "lifecycle_operation_duration_seconds";

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus builder with the buckets used for operation durations.
///
/// # Errors
///
/// Returns [`MetricsError::Build`] if the bucket configuration is rejected.
pub fn prometheus_builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Process-wide Prometheus recorder.
pub struct PrometheusMetrics {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

impl PrometheusMetrics {
    /// Describe the lifecycle metrics and install a Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or installed. A
    /// recorder installed earlier is tolerated: the returned value then has
    /// no handle and [`render`](Self::render) returns `None`.
    pub fn install() -> Result<Self, MetricsError> {
        register_metrics();

        match prometheus_builder()?.install_recorder() {
            Ok(handle) => {
                tracing::info!("Prometheus recorder installed");
                Ok(Self {
                    handle: Some(handle),
                })
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(Self { handle: None })
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(STARTED, "Total number of operations started");
    describe_counter!(COMPLETED, "Total number of operations completed, by resolution");
    describe_gauge!(IN_FLIGHT, "Number of operations currently in flight");
    describe_histogram!(DURATION, "Time from operation start to completion");
}

/// Feeds operation metrics from a coordinator's global bus.
///
/// Forwarded contexts are not counted: each operation is recorded once, on
/// the owner that started it. Unsubscribes when dropped.
#[derive(Debug)]
pub struct LifecycleMetrics {
    bus: Rc<EventBus<OperationEvent>>,
    subscription: SubscriptionId,
}

impl LifecycleMetrics {
    /// Start recording operations started through `coordinator`.
    ///
    /// Requires global events to be enabled on the coordinator.
    #[must_use]
    pub fn install(coordinator: &Coordinator) -> Self {
        let bus = Rc::clone(coordinator.global_events());
        let subscription = bus.on(OperationTopic::Operation, |event| observe(event.context()));
        Self { bus, subscription }
    }

    /// Record an operation start.
    pub fn record_start(kind: &str) {
        counter!(STARTED, "kind" => kind.to_owned()).increment(1);
        gauge!(IN_FLIGHT).increment(1.0);
    }

    /// Record an operation completion.
    pub fn record_complete(kind: &str, resolution: &Resolution, elapsed: Duration) {
        counter!(COMPLETED, "kind" => kind.to_owned(), "resolution" => resolution.as_str().to_owned())
            .increment(1);
        gauge!(IN_FLIGHT).decrement(1.0);
        histogram!(DURATION, "kind" => kind.to_owned()).record(elapsed.as_secs_f64());
    }
}

impl Drop for LifecycleMetrics {
    fn drop(&mut self) {
        self.bus.off(self.subscription);
    }
}

fn observe(context: &RequestContext) {
    let started = Instant::now();
    LifecycleMetrics::record_start(context.kind());

    // An owner-level observer may already have aborted the operation.
    if context.is_finished() {
        if let Some(resolution) = context.resolution() {
            LifecycleMetrics::record_complete(context.kind(), &resolution, started.elapsed());
        }
        return;
    }

    context.on(LifecycleEventName::Complete, move |event| {
        if let Lifecycle::Complete { resolution, .. } = &event.payload {
            LifecycleMetrics::record_complete(event.context.kind(), resolution, started.elapsed());
        }
    });
}
