// src/process/error.rs

use thiserror::Error;

use crate::workflow::FaultCause;

/// Why a process could not be launched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("rejected by backend: {0}")]
    InvalidSpec(String),

    #[error("process handle already started")]
    AlreadyStarted,

    #[error("start cancelled")]
    Cancelled,
}

impl StartError {
    pub fn fault_cause(&self) -> FaultCause {
        match self {
            StartError::BackendUnavailable(_) => FaultCause::BackendUnavailable,
            StartError::ImagePullFailed(_)
            | StartError::ExecutableNotFound(_)
            | StartError::PermissionDenied(_)
            | StartError::InvalidSpec(_) => FaultCause::InvalidSpec,
            StartError::ResourceExhausted(_) => FaultCause::ResourceExhausted,
            StartError::AlreadyStarted => FaultCause::AlreadyStarted,
            StartError::Cancelled => FaultCause::Timeout,
        }
    }
}

/// Failure while stopping or releasing a process.
///
/// The handle is still considered exited after any of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StopError {
    #[error("backend error while stopping process: {0}")]
    Backend(String),

    #[error("{operation} request did not finish within {after:?}")]
    Timeout {
        operation: &'static str,
        after: std::time::Duration,
    },

    #[error("forced kill was not confirmed within {0:?}; exit recorded as killed")]
    KillUnconfirmed(std::time::Duration),
}
