//! Error types and numeric codes.
//!
//! Every error maps to a negative integer so that it can cross a C-style
//! boundary unchanged: library errors live at `-(0x100 + n)`, monitor and
//! argument errors reuse POSIX errno values.

use gcs_proto::ProtocolError;
use thiserror::Error;

use crate::backend::BackendError;

/// POSIX errno values used by the monitor and argument checks (Linux
/// numbering).
pub mod errno {
    /// Interrupted (withdrawn monitor slot)
    pub const EINTR: i32 = 4;
    /// Bad handle (destroyed monitor)
    pub const EBADF: i32 = 9;
    /// Try again (monitor queue full)
    pub const EAGAIN: i32 = 11;
    /// Resource busy
    pub const EBUSY: i32 = 16;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// Out of range (out-of-order monitor operation)
    pub const ERANGE: i32 = 34;
    /// Operation canceled
    pub const ECANCELED: i32 = 125;
}

/// Result type for connection operations.
pub type Result<T, E = GcsError> = std::result::Result<T, E>;

/// Base of library-specific error codes.
pub const GCS_ERR_BASE: i32 = 0x100;

/// Errors returned by connection operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcsError {
    /// Generic failure
    #[error("generic failure: {0}")]
    Other(String),

    /// Internal library error
    #[error("internal error: {0}")]
    Internal(String),

    /// Channel could not be joined
    #[error("channel error: {0}")]
    Channel(String),

    /// Socket-level failure inside a driver
    #[error("socket error: {0}")]
    Socket(String),

    /// Backend refused or lost the message
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Backend could not be reached
    #[error("could not connect: {0}")]
    CouldNotConnect(String),

    /// Connection was closed while the call was in progress
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection is not open
    #[error("not connected")]
    NotConnected,

    /// Action could not be ordered: not in a primary configuration
    #[error("not in primary configuration")]
    NonPrimary,

    /// Action was aborted
    #[error("action aborted")]
    Aborted,

    /// Caller passed an unusable argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Handle is still in use
    #[error("connection still open")]
    Busy,
}

impl GcsError {
    /// Negative integer code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Other(_) => -GCS_ERR_BASE,
            Self::Internal(_) => -(GCS_ERR_BASE + 1),
            Self::Channel(_) => -(GCS_ERR_BASE + 2),
            Self::Socket(_) => -(GCS_ERR_BASE + 3),
            Self::Backend(_) => -(GCS_ERR_BASE + 4),
            Self::CouldNotConnect(_) => -(GCS_ERR_BASE + 5),
            Self::ConnectionClosed => -(GCS_ERR_BASE + 6),
            Self::NotConnected => -(GCS_ERR_BASE + 7),
            Self::NonPrimary => -(GCS_ERR_BASE + 8),
            Self::Aborted => -(GCS_ERR_BASE + 9),
            Self::InvalidArgument(_) => -errno::EINVAL,
            Self::Busy => -errno::EBUSY,
        }
    }
}

impl From<ProtocolError> for GcsError {
    fn from(err: ProtocolError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

/// Brief description of an error code, in the manner of `strerror()`.
///
/// Accepts any code returned by this crate, with or without the sign.
pub fn strerror(code: i32) -> &'static str {
    match code.saturating_abs() {
        0 => "Success",
        c if c == GCS_ERR_BASE => "Generic failure",
        c if c == GCS_ERR_BASE + 1 => "Internal library error",
        c if c == GCS_ERR_BASE + 2 => "Channel error",
        c if c == GCS_ERR_BASE + 3 => "Socket error",
        c if c == GCS_ERR_BASE + 4 => "Backend error",
        c if c == GCS_ERR_BASE + 5 => "Could not connect",
        c if c == GCS_ERR_BASE + 6 => "Connection closed",
        c if c == GCS_ERR_BASE + 7 => "Not connected",
        c if c == GCS_ERR_BASE + 8 => "Non-primary configuration",
        c if c == GCS_ERR_BASE + 9 => "Action aborted",
        errno::EAGAIN => "Too many waiters, try again",
        errno::ERANGE => "Out-of-order monitor operation",
        errno::EBUSY => "Resource busy",
        errno::ECANCELED => "Canceled",
        errno::EINTR => "Withdrawn",
        errno::EBADF => "Monitor destroyed",
        errno::EINVAL => "Invalid argument",
        _ => "Unknown error",
    }
}
