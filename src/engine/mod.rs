//! The I/O engines dispatch hands requests to once a cache mode is
//! resolved. Only the pass-through engine ([`pt`]) is implemented in
//! full; the lazy-write and write-back engines the dispatch table also
//! needs are reference stand-ins (see `dispatch.rs`) since their
//! metadata/write-allocation logic is out of scope.

pub mod pt;

use std::sync::Arc;

use crate::cache::Cache;
use crate::concurrency::{HashBucketLocks, LineLockManager};
use crate::stats::Stats;
use crate::traverse::TraverseService;

/// Forwards the final read/write to the backing core device. An
/// external collaborator in the real system; this crate only needs the
/// seam plus a reference in-memory backing store.
pub trait CoreIoSubmitter: Send + Sync {
    fn submit_read(
        &self,
        req: &crate::request::Request,
        on_complete: Box<dyn FnOnce(crate::request::Request, Result<(), i32>) + Send>,
    );

    fn submit_write(
        &self,
        req: &crate::request::Request,
        on_complete: Box<dyn FnOnce(crate::request::Request, Result<(), i32>) + Send>,
    );

    fn submit_flush(
        &self,
        req: &crate::request::Request,
        on_complete: Box<dyn FnOnce(crate::request::Request, Result<(), i32>) + Send>,
    );

    fn submit_discard(
        &self,
        req: &crate::request::Request,
        on_complete: Box<dyn FnOnce(crate::request::Request, Result<(), i32>) + Send>,
    );
}

/// A reference core device: every forwarded I/O succeeds, completing
/// asynchronously on a fresh thread (no real storage is touched).
#[derive(Debug, Default)]
pub struct InMemoryCoreIo;

/// Shared by every `InMemoryCoreIo` submit method: hold a reference for
/// the duration of the simulated I/O, complete on a fresh thread (the
/// device layer never completes inline), release on the way out.
fn spawn_complete(
    req: &crate::request::Request,
    on_complete: Box<dyn FnOnce(crate::request::Request, Result<(), i32>) + Send>,
) {
    let held = req.get();
    let req = req.clone();
    std::thread::spawn(move || {
        on_complete(req, Ok(()));
        held.put();
    });
}

impl CoreIoSubmitter for InMemoryCoreIo {
    fn submit_read(
        &self,
        req: &crate::request::Request,
        on_complete: Box<dyn FnOnce(crate::request::Request, Result<(), i32>) + Send>,
    ) {
        spawn_complete(req, on_complete);
    }

    fn submit_write(
        &self,
        req: &crate::request::Request,
        on_complete: Box<dyn FnOnce(crate::request::Request, Result<(), i32>) + Send>,
    ) {
        spawn_complete(req, on_complete);
    }

    fn submit_flush(
        &self,
        req: &crate::request::Request,
        on_complete: Box<dyn FnOnce(crate::request::Request, Result<(), i32>) + Send>,
    ) {
        spawn_complete(req, on_complete);
    }

    fn submit_discard(
        &self,
        req: &crate::request::Request,
        on_complete: Box<dyn FnOnce(crate::request::Request, Result<(), i32>) + Send>,
    ) {
        spawn_complete(req, on_complete);
    }
}

/// The collaborators every engine needs: the cache-line lock manager,
/// the hash-bucket protection locks, the traverse/metadata service, the
/// core device, cache-wide context, and counters. Bundled so dispatch
/// can build it once and hand an `Arc` to whichever engine a request's
/// resolved mode selects.
pub struct EngineContext {
    pub lock_mgr: Arc<dyn LineLockManager>,
    pub hash_locks: Arc<HashBucketLocks>,
    pub traverse: Arc<dyn TraverseService>,
    pub core_io: Arc<dyn CoreIoSubmitter>,
    pub cache: Arc<Cache>,
    pub stats: Arc<Stats>,
    /// Where a seq-cutoff dirty hit hands the request back to (the
    /// cache-aware read path dispatch selects for non-pt modes).
    pub redirect_to_generic_read: Box<dyn Fn(crate::request::Request) + Send + Sync>,
}
