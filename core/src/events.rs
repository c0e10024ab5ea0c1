//! Event payload contracts.
//!
//! Every bus in the coordinator carries one of the tagged unions defined here:
//!
//! | Bus | Event | Topic |
//! |-----|-------|-------|
//! | request context | [`LifecycleEvent`] | [`LifecycleEventName`] |
//! | owner | [`OwnerEvent`] | [`OwnerTopic`] |
//! | global | [`OperationEvent`] | [`OperationTopic`] |
//!
//! Lifecycle events always carry the context they are delivered for. When an
//! event is replayed onto a forwarded child, the child is substituted as the
//! event's context while the payload is passed through unchanged.

use crate::context::RequestContext;
use crate::error::LifecycleError;
use crate::event_bus::BusEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Failure reported by a transport.
///
/// The coordinator never interprets it; it reaches observers and the
/// caller's error callback exactly as the transport produced it.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("transport failure{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct TransportError {
    /// Protocol status code, when the transport has one
    pub status: Option<u16>,
    /// Human-readable description
    pub message: String,
    /// Response body or any structured detail
    #[serde(default)]
    pub body: Value,
}

impl TransportError {
    /// Create an error with only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            body: Value::Null,
        }
    }

    /// Attach a status code.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a structured body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// Result signalled by a transport (or supplied manually / as an override).
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The operation produced data
    Success(Value),
    /// The operation failed
    Error(TransportError),
}

impl Outcome {
    /// Resolution this outcome leads to.
    #[must_use]
    pub const fn resolution(&self) -> Resolution {
        match self {
            Self::Success(_) => Resolution::Success,
            Self::Error(_) => Resolution::Error,
        }
    }

    /// Whether this is [`Outcome::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// How a context reached `complete`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Default success path or manual `success`
    Success,
    /// Default error path or manual `error`
    Error,
    /// `abort()` was called
    Abort,
    /// Manual `complete(kind)` with any other kind
    Custom(String),
}

impl Resolution {
    /// String form used in event labels and logs.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Abort => "abort",
            Self::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Resolution {
    fn from(kind: &str) -> Self {
        match kind {
            "success" => Self::Success,
            "error" => Self::Error,
            "abort" => Self::Abort,
            other => Self::Custom(other.to_owned()),
        }
    }
}

impl From<String> for Resolution {
    fn from(kind: String) -> Self {
        Self::from(kind.as_str())
    }
}

/// Names of the events a [`RequestContext`] emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleEventName {
    /// Before the transport call is issued
    BeforeSend,
    /// Transport signalled, before callbacks run
    AfterSend,
    /// Successful transport data, right after `after-send`
    Data,
    /// Success callback has run
    Success,
    /// Error callback has run
    Error,
    /// Terminal event
    Complete,
    /// `abort()` was called
    Abort,
}

impl LifecycleEventName {
    /// Every event name, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::BeforeSend,
        Self::AfterSend,
        Self::Data,
        Self::Success,
        Self::Error,
        Self::Complete,
        Self::Abort,
    ];

    /// Wire name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BeforeSend => "before-send",
            Self::AfterSend => "after-send",
            Self::Data => "data",
            Self::Success => "success",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Abort => "abort",
        }
    }
}

impl fmt::Display for LifecycleEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleEventName {
    type Err = LifecycleError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == name)
            .ok_or_else(|| LifecycleError::UnknownEvent(name.to_owned()))
    }
}

/// Payload of a lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    /// The transport call is about to be issued
    BeforeSend,
    /// The transport signalled an outcome
    AfterSend {
        /// Outcome as reported by the transport
        outcome: Outcome,
    },
    /// The transport reported data
    Data {
        /// Data as reported by the transport
        data: Value,
    },
    /// The operation succeeded
    Success {
        /// Data after any override
        data: Value,
    },
    /// The operation failed
    Error {
        /// Failure after any override
        error: TransportError,
    },
    /// The context reached its terminal state
    Complete {
        /// How it got there
        resolution: Resolution,
        /// Final outcome, absent for aborts and manual `complete(kind)`
        outcome: Option<Outcome>,
    },
    /// The operation was aborted
    Abort,
}

impl Lifecycle {
    /// Name subscribers use to select this payload.
    #[must_use]
    pub const fn name(&self) -> LifecycleEventName {
        match self {
            Self::BeforeSend => LifecycleEventName::BeforeSend,
            Self::AfterSend { .. } => LifecycleEventName::AfterSend,
            Self::Data { .. } => LifecycleEventName::Data,
            Self::Success { .. } => LifecycleEventName::Success,
            Self::Error { .. } => LifecycleEventName::Error,
            Self::Complete { .. } => LifecycleEventName::Complete,
            Self::Abort => LifecycleEventName::Abort,
        }
    }
}

/// Event delivered on a context's bus.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    /// Context the event is delivered for (the child, when forwarded)
    pub context: RequestContext,
    /// What happened
    pub payload: Lifecycle,
}

impl LifecycleEvent {
    /// Shorthand for `self.payload.name()`.
    #[must_use]
    pub const fn name(&self) -> LifecycleEventName {
        self.payload.name()
    }
}

impl BusEvent for LifecycleEvent {
    type Topic = LifecycleEventName;

    fn matches(&self, topic: &LifecycleEventName) -> bool {
        self.payload.name() == *topic
    }
}

/// Event delivered on an owner's bus.
#[derive(Debug, Clone)]
pub enum OwnerEvent {
    /// `operation`: any operation started (or was forwarded) on this owner
    Operation(RequestContext),
    /// `operation:{kind}`: same, selectable by kind
    KindOperation(RequestContext),
    /// `operation:all-complete`: the owner has no operation in flight anymore.
    /// Carries the context whose completion emptied the owner.
    AllComplete(RequestContext),
}

impl OwnerEvent {
    /// Context carried by the event.
    #[must_use]
    pub const fn context(&self) -> &RequestContext {
        match self {
            Self::Operation(context) | Self::KindOperation(context) | Self::AllComplete(context) => {
                context
            }
        }
    }

    /// Event name as observers know it (`operation`, `operation:read`, ...).
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Operation(_) => "operation".to_owned(),
            Self::KindOperation(context) => format!("operation:{}", context.kind()),
            Self::AllComplete(_) => "operation:all-complete".to_owned(),
        }
    }
}

/// Subscription filter for [`OwnerEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerTopic {
    /// Every started operation
    Operation,
    /// Started operations of one kind
    Kind(String),
    /// The owner's in-flight set became empty
    AllComplete,
}

impl BusEvent for OwnerEvent {
    type Topic = OwnerTopic;

    fn matches(&self, topic: &OwnerTopic) -> bool {
        match (self, topic) {
            (Self::Operation(_), OwnerTopic::Operation)
            | (Self::AllComplete(_), OwnerTopic::AllComplete) => true,
            (Self::KindOperation(context), OwnerTopic::Kind(kind)) => context.kind() == kind,
            _ => false,
        }
    }
}

/// Event delivered on the global bus. Forwarded children never appear here.
#[derive(Debug, Clone)]
pub enum OperationEvent {
    /// `operation`: an operation started on any owner
    Operation(RequestContext),
    /// `operation:{kind}`
    KindOperation(RequestContext),
}

impl OperationEvent {
    /// Context carried by the event.
    #[must_use]
    pub const fn context(&self) -> &RequestContext {
        match self {
            Self::Operation(context) | Self::KindOperation(context) => context,
        }
    }
}

/// Subscription filter for [`OperationEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationTopic {
    /// Every started operation
    Operation,
    /// Started operations of one kind
    Kind(String),
}

impl BusEvent for OperationEvent {
    type Topic = OperationTopic;

    fn matches(&self, topic: &OperationTopic) -> bool {
        match (self, topic) {
            (Self::Operation(_), OperationTopic::Operation) => true,
            (Self::KindOperation(context), OperationTopic::Kind(kind)) => context.kind() == kind,
            _ => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_names_round_trip_through_strings() {
        for name in LifecycleEventName::ALL {
            assert_eq!(name.as_str().parse::<LifecycleEventName>().unwrap(), name);
        }
        assert_eq!(
            "xhr".parse::<LifecycleEventName>(),
            Err(LifecycleError::UnknownEvent("xhr".to_owned()))
        );
    }

    #[test]
    fn custom_resolutions_keep_their_name() {
        assert_eq!(Resolution::from("success"), Resolution::Success);
        assert_eq!(Resolution::from("abort"), Resolution::Abort);
        let halted = Resolution::from("halt");
        assert_eq!(halted, Resolution::Custom("halt".to_owned()));
        assert_eq!(halted.to_string(), "halt");
    }

    #[test]
    fn outcome_maps_to_resolution() {
        assert_eq!(Outcome::Success(json!(1)).resolution(), Resolution::Success);
        let failure = Outcome::Error(TransportError::new("boom"));
        assert_eq!(failure.resolution(), Resolution::Error);
        assert!(!failure.is_success());
    }

    #[test]
    fn transport_error_display_includes_status() {
        let plain = TransportError::new("connection reset");
        assert_eq!(plain.to_string(), "transport failure: connection reset");

        let http = TransportError::new("not found")
            .with_status(404)
            .with_body(json!({"path": "/users/1"}));
        assert_eq!(http.to_string(), "transport failure (404): not found");

        let encoded = serde_json::to_value(&http).unwrap();
        assert_eq!(encoded["status"], json!(404));
        assert_eq!(encoded["body"]["path"], json!("/users/1"));
    }
}
