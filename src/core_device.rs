//! The backing core device handle and its "blocked" predicate
//! (`core_is_blocked`, carried over from `ocf_core_status.c` minus the
//! SPDK `bdev` binding it was tied to).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// A handle to the slow core device backing one cache instance slice.
///
/// Holds the per-core read-error counter that the pass-through read
/// path increments on core I/O failure, and a runtime-busy flag upper
/// layers can poll via [`CoreDevice::is_blocked`].
#[derive(Debug)]
pub struct CoreDevice {
    id: u32,
    read_errors: Arc<AtomicU32>,
    blocked: AtomicBool,
}

impl CoreDevice {
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self {
            id,
            read_errors: Arc::new(AtomicU32::new(0)),
            blocked: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Shared handle to this core's read-error counter, to be threaded
    /// into every [`crate::request::Request`] built against this core
    /// (see [`crate::request::Request::record_core_read_error`]).
    #[must_use]
    pub fn read_errors(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.read_errors)
    }

    #[must_use]
    pub fn read_error_count(&self) -> u32 {
        self.read_errors.load(Ordering::Acquire)
    }

    /// Reports whether the underlying device is in a runtime-busy
    /// state (`core_is_blocked`). Upper layers use this to
    /// short-circuit admission before even building a request.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
    }
}

/// Reports whether a request's upper-layer I/O context is blocked
/// (`io_is_blocked`). The reference implementation here simply mirrors
/// the originating core's blocked state, since (unlike the SPDK-bound
/// original) this crate does not own a host-driver I/O context type to
/// inspect.
#[must_use]
pub fn io_is_blocked(core: &CoreDevice) -> bool {
    core.is_blocked()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_flag_round_trips() {
        let core = CoreDevice::new(0);
        assert!(!core.is_blocked());
        core.set_blocked(true);
        assert!(core.is_blocked());
        assert!(io_is_blocked(&core));
    }
}
