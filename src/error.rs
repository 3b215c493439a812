//! Error kinds surfaced by the dispatch and pass-through core.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors the dispatch/pass-through core can surface.
///
/// Propagation policy is "no local retry": every variant is either
/// returned synchronously from an entry point or handed to
/// [`crate::request::Request::complete`] exactly once.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No handler is registered for the requested `(mode, direction)` pair.
    #[error("no handler registered for this cache mode / direction")]
    Invalid,

    /// Allocation failure (parallelizer shard/priv allocation).
    #[error("allocation failed")]
    NoMem,

    /// The cache-line lock manager returned a negative status.
    #[error("lock acquisition failed with status {status}")]
    LockError {
        /// Raw status code returned by the lock manager.
        status: i32,
    },

    /// The core device returned an error for a forwarded I/O.
    #[error("core device I/O failed with status {status}")]
    CoreIoError {
        /// Raw status code returned by the core device.
        status: i32,
    },

    /// Clean (write-back of dirty lines) submission failed.
    #[error("clean submission failed with status {status}")]
    CleanError {
        /// Raw status code returned by the clean subsystem.
        status: i32,
    },
}

impl Error {
    /// Raw status code, for handing to [`crate::request::Complete`].
    #[must_use]
    pub fn status(self) -> i32 {
        match self {
            Error::Invalid => -1,
            Error::NoMem => -2,
            Error::LockError { status }
            | Error::CoreIoError { status }
            | Error::CleanError { status } => status,
        }
    }
}
