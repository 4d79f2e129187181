//! Error types for bufsurface.

use crate::format::ColorFormat;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using bufsurface's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer-surface operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A parameter was rejected before any resource was touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The color format is unknown or cannot be laid out.
    #[error("invalid color format: {0:?}")]
    InvalidFormat(ColorFormat),

    /// No block is available (pool cache empty, hardware pool drained).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Two surfaces cannot take part in the same operation.
    #[error("incompatible operands: {0}")]
    IncompatibleOperands(String),

    /// The operation has no meaning for this memory kind.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The driver or allocator refused to hand out memory.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A device runtime call failed.
    #[error("device runtime error: {0}")]
    Device(String),

    /// The pool was never created or has already been destroyed.
    #[error("memory pool is not created")]
    NotCreated,

    /// The hardware still holds the resource; the caller may retry.
    #[error("resource busy: {0}")]
    Busy(String),

    /// A bounded wait ran out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Whether retrying the same call later can succeed.
    ///
    /// Exhaustion clears when another holder returns a block, and a busy
    /// hardware block frees up once the engine using it finishes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_) | Error::Busy(_))
    }

    /// Status code reported across the C ABI.
    ///
    /// The ABI carries no richer error information: every failure is `-1`.
    #[inline]
    pub fn status(&self) -> i32 {
        -1
    }
}
