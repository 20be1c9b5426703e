//! Unified error handling for npuforge
//!
//! Every public operation returns [`ForgeResult`]. Errors fall into the
//! categories callers need for handling decisions:
//! - User errors (bad device index, bad argument, precondition violated)
//! - Recoverable errors (out of memory, which may succeed after freeing)
//! - Backend errors (native runtime failures, partial device reset)
//! - Internal errors (poisoned locks, broken bookkeeping)

use std::fmt;

use crate::backend::acl_backend::{AclError, DeviceIndex};

/// Everything known about a failed allocation at the moment it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OomReport {
    pub device: DeviceIndex,
    /// Bytes the allocator tried to obtain (after rounding).
    pub requested: usize,
    /// Bytes currently handed out to callers on this device.
    pub allocated: usize,
    /// Bytes reserved from the device by the allocator.
    pub reserved: usize,
    /// Free device memory reported by the runtime.
    pub free: usize,
    /// Budget set through the memory fraction, if any.
    pub allowed: Option<usize>,
}

impl fmt::Display for OomReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NPU out of memory on device {}: tried to allocate {} bytes ({} bytes allocated, {} bytes reserved by the caching allocator, {} bytes free",
            self.device, self.requested, self.allocated, self.reserved, self.free
        )?;
        if let Some(allowed) = self.allowed {
            write!(f, ", {} bytes allowed by the memory fraction", allowed)?;
        }
        write!(f, ")")
    }
}

/// Unified error type for npuforge
#[derive(Debug, thiserror::Error)]
pub enum NpuForgeError {
    // ========== Backend Errors ==========
    /// Native runtime call failed
    #[error("NPU runtime error: {0}")]
    Acl(#[from] AclError),

    /// Device reset stopped part way through the registered devices
    #[error("Device reset failed on device {failed_device} after resetting {reset:?}: {source}")]
    PartialReset {
        failed_device: DeviceIndex,
        reset: Vec<DeviceIndex>,
        #[source]
        source: AclError,
    },

    // ========== Recoverable Errors ==========
    /// Device memory exhausted even after releasing cached blocks
    #[error("{0}")]
    OutOfMemory(Box<OomReport>),

    // ========== User Errors ==========
    /// Device index outside the range reported by the runtime
    #[error("Invalid device index {index}: {count} device(s) available")]
    InvalidDevice { index: DeviceIndex, count: DeviceIndex },

    /// Invalid argument value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid allocator or runtime configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation called in a state that does not allow it
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Synchronizing call made while sync debug mode is set to error
    #[error("Synchronizing operation rejected by sync debug mode: {0}")]
    SyncDebugViolation(String),

    /// Operation not provided by the active backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (indicates a bug or concurrent access issue)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl NpuForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            NpuForgeError::InvalidDevice { .. }
            | NpuForgeError::InvalidArgument(_)
            | NpuForgeError::InvalidConfiguration(_)
            | NpuForgeError::PreconditionFailed(_)
            | NpuForgeError::SyncDebugViolation(_)
            | NpuForgeError::Unsupported(_) => ErrorCategory::User,

            NpuForgeError::OutOfMemory(_) => ErrorCategory::Recoverable,

            NpuForgeError::Acl(AclError::LockPoisoned(_))
            | NpuForgeError::InternalError(_)
            | NpuForgeError::LockPoisoned(_) => ErrorCategory::Internal,

            NpuForgeError::Acl(_) | NpuForgeError::PartialReset { .. } => ErrorCategory::Backend,
        }
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// Out-of-memory and runtime-reported transient failures may succeed
    /// when retried after other work frees memory or drains.
    pub fn is_recoverable(&self) -> bool {
        match self {
            NpuForgeError::OutOfMemory(_) => true,
            NpuForgeError::Acl(err) => err.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, NpuForgeError::OutOfMemory(_))
    }

    /// The OOM report, when this is an out-of-memory error.
    pub fn oom_report(&self) -> Option<&OomReport> {
        match self {
            NpuForgeError::OutOfMemory(report) => Some(&**report),
            _ => None,
        }
    }

    /// Native status code behind this error, if any.
    pub fn acl_code(&self) -> Option<i32> {
        match self {
            NpuForgeError::Acl(err) => err.code(),
            NpuForgeError::PartialReset { source, .. } => source.code(),
            _ => None,
        }
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid input, state or configuration
    User,
    /// Recoverable error - temporary condition
    Recoverable,
    /// Internal error - indicates a bug
    Internal,
    /// Backend error - native runtime failure
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Backend => write!(f, "Backend"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for NpuForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        NpuForgeError::LockPoisoned(err.to_string())
    }
}

/// Helper type alias for Results using NpuForgeError
pub type ForgeResult<T> = std::result::Result<T, NpuForgeError>;

/// Create a precondition error with context
///
/// # Examples
/// ```ignore
/// return Err(precondition_error!("stream pool for device {} was destroyed", device));
/// ```
#[macro_export]
macro_rules! precondition_error {
    ($msg:expr) => {
        $crate::error::NpuForgeError::PreconditionFailed($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NpuForgeError::PreconditionFailed(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("block {} missing from segment", id));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::NpuForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::NpuForgeError::InternalError(format!($fmt, $($arg)*))
    };
}
