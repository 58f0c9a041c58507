//! Error taxonomy and errno mapping for the middleware core.
//!
//! Mirrors the original's `IOMIDDLE_IFERROR` macro: configuration and
//! contract-violation errors are not recoverable and terminate the process,
//! while disk and worker errors are surfaced back to the application as a
//! short read/write return. `spec.md` §7 describes the disk-error case as
//! "converted to a `-1ULL` flush result"; this crate represents that same
//! outcome as `Err(MiddlewareError::Disk { .. })` plus `is_recoverable()`
//! rather than a raw sentinel integer, so `iomiddle-shim`'s `write`/`read`
//! wrappers (the only place a POSIX-shaped return value exists) turn a
//! recoverable error into `-1` right where it's returned, instead of
//! threading a magic `u64` through every intermediate `Result<u64>`.

use std::io;
use thiserror::Error;

/// Errors produced by the middleware core.
#[derive(Debug, Error)]
pub enum MiddlewareError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The application violated the middleware's usage contract
    /// (mixed read/write on one descriptor, non-uniform transfer length,
    /// end-relative lseek, non-monotonic lseek, allocation failure).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A disk I/O error occurred on the underlying file descriptor.
    #[error("disk I/O error: {source}")]
    Disk {
        #[source]
        source: io::Error,
        /// Path of the managed file, for diagnostic context.
        path: String,
    },

    /// The background worker reported a failure at the next post.
    #[error("worker error: {0}")]
    Worker(String),
}

impl MiddlewareError {
    /// Configuration/contract-violation errors are fatal: log and abort the
    /// process, matching `IOMIDDLE_IFERROR`'s `abort()` behavior. A real
    /// `panic!` would unwind across the FFI boundary the intercepted
    /// application does not expect, so this calls `abort()` directly.
    pub fn fatal(&self) -> ! {
        tracing::error!(error = %self, "fatal middleware error");
        std::process::abort();
    }

    /// Whether this error represents the kind of disk failure that should
    /// propagate to the application as a short read/write rather than
    /// aborting the process.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MiddlewareError::Disk { .. } | MiddlewareError::Worker(_))
    }
}

pub type Result<T> = std::result::Result<T, MiddlewareError>;
