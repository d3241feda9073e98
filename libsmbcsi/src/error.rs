//! CSI error types.
//!
//! All errors in the `libsmbcsi` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer.  Every variant maps onto one of the status
//! [`Code`]s the orchestrator understands.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status classes reported to the orchestrator, mirroring the gRPC codes
/// used by the CSI specification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Code {
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    Unimplemented,
    Internal,
    Unavailable,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid or incomplete argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An object with the same name exists but cannot satisfy the request.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The object is in a state that forbids the operation (e.g. delete
    /// while attached).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Another operation for the same key is already in flight.
    #[error("operation aborted: {0}")]
    Aborted(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The operation is deliberately not supported by this plugin.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// The request was cancelled before it could complete.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A bounded operation (e.g. a mount against an unreachable share) ran
    /// out of time.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error (local filesystem, archive, registry).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// The status class of this error.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::NotFound(_) => Code::NotFound,
            Self::AlreadyExists(_) => Code::AlreadyExists,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::Aborted(_) => Code::Aborted,
            Self::MountFailed { .. } | Self::UnmountFailed { .. } | Self::Internal(_) => {
                Code::Internal
            }
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::Cancelled(_) => Code::Cancelled,
            Self::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Self::TransportError(_) => Code::Unavailable,
        }
    }
}
