//! ACL runtime error types
//!
//! Every native call returns an `i32` status. A non-zero status becomes an
//! [`AclError::Runtime`] carrying the API name, the raw code and whatever
//! message the runtime (or simulated driver) attached to it.

use thiserror::Error;

/// Success status shared by every ACL entry point.
pub const ACL_SUCCESS: i32 = 0;
/// A handle or argument passed to the runtime is invalid.
pub const ACL_ERROR_RT_PARAM_INVALID: i32 = 107000;
/// `aclrtSetDevice` was given an index outside the device range.
pub const ACL_ERROR_RT_INVALID_DEVICEID: i32 = 107001;
/// No context has been established on the calling thread yet.
pub const ACL_ERROR_RT_CONTEXT_NULL: i32 = 107002;
/// A bounded stream synchronize ran out of time.
pub const ACL_ERROR_RT_STREAM_SYNC_TIMEOUT: i32 = 107019;
/// The driver does not implement the requested feature.
pub const ACL_ERROR_RT_FEATURE_NOT_SUPPORT: i32 = 207000;
/// Device memory is exhausted.
pub const ACL_ERROR_RT_MEMORY_ALLOCATION: i32 = 207001;

/// ACL error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AclError {
    #[error("{api} failed with error code {code}: {message}")]
    Runtime {
        api: &'static str,
        code: i32,
        message: String,
    },
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for AclError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        AclError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// ACL result type
pub type AclResult<T> = Result<T, AclError>;

impl AclError {
    pub fn runtime(api: &'static str, code: i32, message: impl Into<String>) -> Self {
        AclError::Runtime {
            api,
            code,
            message: message.into(),
        }
    }

    /// Native status code, if this error came from the runtime.
    pub fn code(&self) -> Option<i32> {
        match self {
            AclError::Runtime { code, .. } => Some(*code),
            AclError::LockPoisoned(_) => None,
        }
    }

    /// Whether the runtime reported that no context exists on this thread.
    pub fn is_context_null(&self) -> bool {
        self.code() == Some(ACL_ERROR_RT_CONTEXT_NULL)
    }

    /// Whether the runtime ran out of device memory.
    pub fn is_out_of_memory(&self) -> bool {
        self.code() == Some(ACL_ERROR_RT_MEMORY_ALLOCATION)
    }

    /// Whether a bounded synchronize timed out.
    pub fn is_timeout(&self) -> bool {
        self.code() == Some(ACL_ERROR_RT_STREAM_SYNC_TIMEOUT)
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// Memory exhaustion and synchronize timeouts may succeed when retried
    /// after other work drains. Everything else indicates misuse or a broken
    /// runtime.
    pub fn is_recoverable(&self) -> bool {
        self.is_out_of_memory() || self.is_timeout()
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}

/// Turn a native status into a result.
///
/// `message` is only evaluated on failure, so it can query the runtime's
/// recent-error buffer.
pub fn check(code: i32, api: &'static str, message: impl FnOnce() -> String) -> AclResult<()> {
    if code == ACL_SUCCESS {
        Ok(())
    } else {
        Err(AclError::runtime(api, code, message()))
    }
}

/// Log a failed cleanup call and carry on.
///
/// Used on teardown paths (stream/event destruction, device restore in drop
/// handlers) where failing the caller would leak more than it saves.
pub fn check_warn<T>(result: AclResult<T>, what: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("{} failed (ignored): {}", what, err);
            None
        }
    }
}
