//! Shared error types for MeshLink.

use crate::state::ServiceState;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for MeshLink.
#[derive(Error, Debug)]
pub enum MeshLinkError {
    /// The resolved agent binary does not exist.
    #[error("Agent binary not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The agent could not be spawned, or kept failing past the restart ceiling.
    #[error("Agent launch failed: {0}")]
    LaunchFailed(String),

    /// The channel to the agent is broken or was torn down.
    #[error("Transport closed during '{command}': {reason}")]
    TransportClosed {
        /// Command (or phase, e.g. `startup`) that observed the failure.
        command: String,
        /// What broke.
        reason: String,
    },

    /// The agent reported a failure for a command.
    #[error("Agent error: {0}")]
    RemoteError(String),

    /// An operation was attempted while the service was not running.
    #[error("Service not running (state: {0})")]
    NotRunning(ServiceState),

    /// The service is in the wrong lifecycle state for the operation.
    #[error("Service is in invalid state '{current}' for operation '{operation}'")]
    InvalidState {
        /// The current state.
        current: ServiceState,
        /// The operation that was attempted.
        operation: String,
    },

    /// The agent replied with something that is not a valid reply.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl MeshLinkError {
    /// Whether the error ends the session rather than a single call.
    ///
    /// `RemoteError`, `NotRunning`, `InvalidState` and `Protocol` affect one
    /// call only; the caller may retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::LaunchFailed(_) | Self::TransportClosed { .. }
        )
    }

    /// Shorthand for a `TransportClosed` error.
    pub fn transport_closed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransportClosed {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Alias for Result with MeshLinkError.
pub type MeshLinkResult<T> = Result<T, MeshLinkError>;
