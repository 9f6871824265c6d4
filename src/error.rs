//! Custom error types for the camera supervisor.
//!
//! This module defines the primary error type, `CamstackError`, shared by every
//! component of the crate. Using the `thiserror` crate, it provides a centralized
//! and consistent way to surface failures from the mode registry, the session
//! layer, the acquisition worker and the keyword pipeline.
//!
//! ## Error Hierarchy
//!
//! - **Supervisor taxonomy**: `HardwareNotFound`, `CannotReconfigureWhileRunning`,
//!   `BackendStartFailed`, `InvalidMode`, `InvalidParameter`, `SerialTimeout`,
//!   `DependentFailed` and `ExternalStoreUnavailable`. These are the errors an
//!   operator sees when a state-machine operation fails.
//! - **Ambient errors**: `Io`, `Config` and `Configuration` for file and
//!   configuration problems, `Session` and `Segment` for the shell and shared-memory
//!   collaborators, `Keyword` for header formatting problems.
//! - **Surface errors**: `InvalidState`, `Unsupported` and `Rpc` for calls that do
//!   not make sense in the current state or through the current camera family.
//!
//! By using `#[from]`, `CamstackError` can be created from underlying error types,
//! simplifying error handling with the `?` operator.

use thiserror::Error;

use crate::camera::state::SupervisorState;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, CamstackError>;

/// Every failure the supervisor reports.
#[derive(Error, Debug)]
pub enum CamstackError {
    /// The camera or its framegrabber is not present
    #[error("Hardware not found: {0}")]
    HardwareNotFound(String),

    /// A worker still holds the hardware after the retry
    #[error("Cannot reconfigure camera while the acquisition worker is running")]
    CannotReconfigureWhileRunning,

    /// The worker never became ready
    #[error("Acquisition worker failed to start: {0}")]
    BackendStartFailed(String),

    /// Unknown mode id, or a window that cannot exist
    #[error("Invalid camera mode: {0}")]
    InvalidMode(String),

    /// The worker answered a parameter request with the sentinel
    #[error("Worker rejected parameter 0x{key:08x} ({})", .keyword.as_deref().unwrap_or("-"))]
    InvalidParameter {
        /// Control-segment key as posted
        key: u32,
        /// Header keyword the value was meant for
        keyword: Option<String>,
    },

    /// No reply to a serial command before the deadline
    #[error("Serial command timed out after {timeout_ms} ms: {command}")]
    SerialTimeout {
        /// Command as sent
        command: String,
        /// Deadline that expired
        timeout_ms: u64,
    },

    /// A dependent process died or could not be launched
    #[error("Dependent process '{name}' failed (critical: {critical})")]
    DependentFailed {
        /// Dependent (and session) name
        name: String,
        /// Set when the dependent is not restartable
        critical: bool,
    },

    /// Push to the keyword mirror failed
    #[error("External keyword store unavailable: {0}")]
    ExternalStoreUnavailable(String),

    /// Filesystem or socket I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed or merged
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Semantic configuration errors, and malformed requests
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// tmux or ssh failure
    #[error("Session error: {0}")]
    Session(String),

    /// Stream or control segment could not be created, mapped or read
    #[error("Shared memory segment error: {0}")]
    Segment(String),

    /// Unknown keyword, bad format or a value of the wrong type
    #[error("Keyword error: {0}")]
    Keyword(String),

    /// The operation makes no sense in the current state
    #[error("Operation '{op}' not allowed in state {state}")]
    InvalidState {
        /// Operation name
        op: &'static str,
        /// State at the time of the call
        state: SupervisorState,
    },

    /// The camera family has no such capability
    #[error("Operation not supported by this camera: {0}")]
    Unsupported(String),

    /// Transport or framing failure on the control surface
    #[error("RPC error: {0}")]
    Rpc(String),
}

impl CamstackError {
    /// Whether the supervisor can keep serving requests after this error.
    ///
    /// Start failures leave the state machine in `MODE_CHANGING` and need an
    /// operator retry or a release; everything else is local to the call.
    pub fn can_recover(&self) -> bool {
        match self {
            CamstackError::BackendStartFailed(_) | CamstackError::HardwareNotFound(_) => false,
            CamstackError::DependentFailed { critical, .. } => !critical,
            CamstackError::Io(_) | CamstackError::Config(_) => false,
            _ => true,
        }
    }

    /// Fatal errors abort the current transaction.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CamstackError::HardwareNotFound(_)
                | CamstackError::CannotReconfigureWhileRunning
                | CamstackError::BackendStartFailed(_)
                | CamstackError::DependentFailed { critical: true, .. }
        )
    }
}

impl From<redis::RedisError> for CamstackError {
    fn from(value: redis::RedisError) -> Self {
        CamstackError::ExternalStoreUnavailable(value.to_string())
    }
}

impl From<anyhow::Error> for CamstackError {
    fn from(value: anyhow::Error) -> Self {
        CamstackError::Segment(format!("{value:#}"))
    }
}

impl From<serde_json::Error> for CamstackError {
    fn from(value: serde_json::Error) -> Self {
        CamstackError::Rpc(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_failure_is_fatal_and_unrecoverable() {
        let err = CamstackError::BackendStartFailed("timeout".into());
        assert!(err.is_fatal());
        assert!(!err.can_recover());
    }

    #[test]
    fn non_critical_dependent_is_recoverable() {
        let err = CamstackError::DependentFailed {
            name: "tcp_send".into(),
            critical: false,
        };
        assert!(!err.is_fatal());
        assert!(err.can_recover());
        assert_eq!(
            err.to_string(),
            "Dependent process 'tcp_send' failed (critical: false)"
        );
    }

    #[test]
    fn invalid_parameter_message_carries_hex_key() {
        let err = CamstackError::InvalidParameter {
            key: 0x001F,
            keyword: Some("EXPTIME".into()),
        };
        assert_eq!(err.to_string(), "Worker rejected parameter 0x0000001f (EXPTIME)");
    }

    #[test]
    fn critical_dependent_message() {
        let err = CamstackError::DependentFailed {
            name: "apd_curv".into(),
            critical: true,
        };
        assert!(err.is_fatal());
        assert!(!err.can_recover());
    }
}
