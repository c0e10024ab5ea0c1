//! Error types for programmer misuse of the coordinator.
//!
//! Transport failures are not errors of the coordinator: they travel as
//! [`TransportError`](crate::events::TransportError) through events and
//! callbacks. Post-terminal lifecycle calls are not errors either; they are
//! ignored.

use crate::context::ContextState;
use thiserror::Error;

/// Errors returned synchronously by coordinator operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// `start` was called with an empty operation kind
    #[error("operation kind must not be empty")]
    EmptyKind,

    /// An operation was requested outside the states that allow it
    #[error("{operation} is not allowed in state '{state}'")]
    InvalidState {
        /// The rejected operation
        operation: &'static str,
        /// State of the context when it was rejected
        state: ContextState,
    },

    /// An event name did not parse
    #[error("unknown lifecycle event: {0}")]
    UnknownEvent(String),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, LifecycleError>;
