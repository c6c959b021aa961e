//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Error taxonomy (spec.md SS7) and its mapping to the application
//! close-reason codes (spec.md SS4.4).

use crate::common::CloseReason;

pub type Result<T> = std::result::Result<T, CallError>;

/// Platform independent error conditions, named after their POSIX-ish
/// wire/protocol counterparts in spec.md so logs and the close-reason
/// mapping stay legible against the spec's own vocabulary.
#[derive(thiserror::Error, Debug, Clone)]
pub enum CallError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition not met: {0}")]
    NotFound(String),

    #[error("call already exists or already answered: {0}")]
    AlreadyExists(String),

    #[error("operation not supported in current state: {0}")]
    NotSupported(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed message: {0}")]
    BadMessage(String),

    #[error("resource exhausted: {0}")]
    Overflow(String),

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("setup timed out")]
    TimedOut,

    #[error("connection state machine timed out waiting for teardown")]
    TimedOutEconn,

    #[error("media connection was lost")]
    ConnectionReset,

    #[error("operation canceled")]
    Canceled,

    #[error("call was answered on another device")]
    AnsweredElsewhere,

    #[error("I/O error from media flow: {0}")]
    Io(String),

    #[error("data channel error: {0}")]
    DataChannel(String),

    #[error("call was rejected by the remote peer")]
    Rejected,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Maps an error to the application-visible close reason (spec.md
    /// SS4.4 "Error -> reason mapping").
    pub fn reason(&self) -> CloseReason {
        match self {
            CallError::TimedOut => CloseReason::Timeout,
            CallError::TimedOutEconn => CloseReason::TimeoutEconn,
            CallError::ConnectionReset => CloseReason::LostMedia,
            CallError::Canceled => CloseReason::Canceled,
            CallError::AnsweredElsewhere => CloseReason::AnsweredElsewhere,
            CallError::Io(_) => CloseReason::IoError,
            CallError::DataChannel(_) => CloseReason::DataChannel,
            CallError::Rejected => CloseReason::Rejected,
            _ => CloseReason::Error,
        }
    }

    /// A short POSIX-ish code, matching spec.md's error vocabulary
    /// (EINVAL, ENOENT, ...), for FFI-shaped call sites (src/api.rs).
    pub fn code(&self) -> i32 {
        match self {
            CallError::InvalidArgument(_) => 22,     // EINVAL
            CallError::NotFound(_) => 2,              // ENOENT
            CallError::AlreadyExists(_) => 114,       // EALREADY
            CallError::NotSupported(_) => 95,         // ENOTSUP
            CallError::Protocol(_) => 71,             // EPROTO
            CallError::BadMessage(_) => 74,           // EBADMSG
            CallError::Overflow(_) => 75,              // EOVERFLOW
            CallError::NoMemory(_) => 12,              // ENOMEM
            CallError::TimedOut => 110,                // ETIMEDOUT
            CallError::TimedOutEconn => 111,           // custom ETIMEDOUT_ECONN
            CallError::ConnectionReset => 104,         // ECONNRESET
            CallError::Canceled => 125,                // ECANCELED
            CallError::AnsweredElsewhere => 114,       // EALREADY
            CallError::Io(_) => 5,                     // EIO
            CallError::DataChannel(_) => 200,          // custom EDATACHANNEL
            CallError::Rejected => 66,                 // EREMOTE
            CallError::Internal(_) => 1,                // EPERM-ish catch-all
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(e: serde_json::Error) -> Self {
        CallError::BadMessage(e.to_string())
    }
}

/// Convenience constructors matching common call sites, avoiding
/// `.to_string()` noise at every call site.
impl CallError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        CallError::InvalidArgument(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        CallError::NotFound(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        CallError::Internal(msg.into())
    }
}
