//! # Error types used by the device runtime and transports.
//!
//! This module defines two main error enums:
//!
//! - [`DeviceError`] errors raised by the lifecycle orchestration itself.
//! - [`TransportError`] errors raised by transport-level operations
//!   (bind/connect/send/receive/poll).
//!
//! Both types provide `as_label` helpers for logs and metrics.
//! [`TransportError`] additionally distinguishes recoverable conditions
//! (`is_retryable`) from hard failures.

use thiserror::Error;

use crate::state::{State, Transition};

/// # Errors produced by the device runtime.
///
/// These represent failures of the lifecycle orchestration: bad configuration,
/// channels that could not be attached in time, illegal state transitions and
/// failed poll workers.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Configuration is missing or contradictory (unknown transport name,
    /// channel without a bind/connect method, undeclared channel referenced
    /// by a callback).
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Human-readable description of what is wrong.
        reason: String,
    },

    /// A binding channel failed its single attach attempt, or a connecting
    /// channel did not attach before the init timeout elapsed.
    #[error("initialization incomplete: {reason}")]
    InitializationIncomplete {
        /// Which channels remained unattached and why.
        reason: String,
    },

    /// The requested transition is not legal from the current state.
    #[error("invalid transition {transition} from state {from}")]
    InvalidTransition {
        /// State the machine was in when the request arrived.
        from: State,
        /// The rejected transition.
        transition: Transition,
    },

    /// A transport operation failed non-recoverably.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A multi-transport poll worker failed.
    #[error("poll worker failed: {reason}")]
    Worker {
        /// The worker's failure, stringified at the point it was logged.
        reason: String,
    },

    /// A user hook returned an error.
    #[error("device hook failed: {reason}")]
    Hook {
        /// The hook's failure reason.
        reason: String,
    },

    /// The machine entered `Error` while a caller was waiting for a
    /// different state.
    #[error("device entered the Error state while waiting for {waiting_for}")]
    EnteredError {
        /// The state the caller was waiting for.
        waiting_for: State,
    },
}

impl DeviceError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DeviceError::InvalidConfiguration { .. } => "invalid_configuration",
            DeviceError::InitializationIncomplete { .. } => "initialization_incomplete",
            DeviceError::InvalidTransition { .. } => "invalid_transition",
            DeviceError::Transport(_) => "transport_failure",
            DeviceError::Worker { .. } => "worker_failed",
            DeviceError::Hook { .. } => "hook_failed",
            DeviceError::EnteredError { .. } => "entered_error",
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        DeviceError::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub(crate) fn incomplete(reason: impl Into<String>) -> Self {
        DeviceError::InitializationIncomplete {
            reason: reason.into(),
        }
    }
}

/// # Errors produced by transport operations.
///
/// `Interrupted` is not an error in the traditional sense: it signals that a
/// blocking operation was aborted because a state transition was requested.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TransportError {
    /// No factory is available for the requested transport kind.
    #[error("unsupported transport '{kind}'")]
    Unsupported { kind: String },

    /// Bind target is already registered by another socket.
    #[error("address already in use: {endpoint}")]
    AddressInUse { endpoint: String },

    /// Connect target does not exist (yet). Retryable.
    #[error("no such endpoint: {endpoint}")]
    NotFound { endpoint: String },

    /// A blocking operation was aborted by a transport interrupt.
    #[error("operation interrupted")]
    Interrupted,

    /// The peer side of the channel is gone.
    #[error("endpoint closed")]
    Closed,

    /// Anything else the transport could not recover from.
    #[error("transport failure: {reason}")]
    Failed { reason: String },
}

impl TransportError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            TransportError::Unsupported { .. } => "transport_unsupported",
            TransportError::AddressInUse { .. } => "transport_address_in_use",
            TransportError::NotFound { .. } => "transport_not_found",
            TransportError::Interrupted => "transport_interrupted",
            TransportError::Closed => "transport_closed",
            TransportError::Failed { .. } => "transport_failed",
        }
    }

    /// Indicates whether retrying the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::NotFound { .. } | TransportError::Interrupted
        )
    }
}
