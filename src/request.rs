//! Request record: per-I/O state carried through the pipeline.
//!
//! Modeled as a cheaply-clonable handle (`Request`) around a shared
//! `Inner`, the way `register_set::Ref` wraps `Arc<Mutex<RegisterSet>>`.
//! Unlike a plain `Arc`, this additionally tracks an explicit logical
//! refcount (`get`/`put`) matching `ocf_req_get`/`ocf_req_put`: every
//! hand-off across a suspension point is paired with a `get`, and every
//! exit branch — including error branches — is paired with a `put`.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::mode::CacheMode;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// I/O direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Information populated by the hash/traverse service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraverseInfo {
    /// Whether any cache line intersecting the request is dirty.
    pub dirty_any: bool,
    /// Number of cache lines that were hit.
    pub hit_no: u32,
    /// Number of cache lines mapped for this request.
    pub mapped_count: u32,
}

/// A one-shot continuation: the handler that runs on the next dispatch
/// of this request. The current handler writes it and returns; the
/// queue worker or async-lock resume callback reads and clears it.
pub type EngineHandler = Box<dyn FnOnce(Request) + Send>;

/// Upward completion callback, invoked exactly once with a status code
/// (0 for success, negative for error — see [`crate::error::Error::status`]).
pub type Complete = Box<dyn FnOnce(&Request, i32) + Send>;

struct State {
    cache_mode: Option<CacheMode>,
    part_id: u32,
    seq_cutoff: bool,
    force_pt: bool,
    info: TraverseInfo,
    engine_handler: Option<EngineHandler>,
}

struct Inner {
    id: u64,
    addr: u64,
    bytes: u32,
    core_line_count: u32,
    rw: Direction,
    state: Mutex<State>,
    refcount: AtomicUsize,
    complete: Mutex<Option<Complete>>,
    completed: AtomicBool,
    /// Opaque upper-layer I/O context.
    priv1: Mutex<Option<Box<dyn Any + Send>>>,
    /// Opaque private data (used by the parallelizer to back-point at
    /// its own state, mirroring `req->priv`).
    priv_data: Mutex<Option<Box<dyn Any + Send>>>,
    /// Cache line lock held by this request, if any (invariant 4: must
    /// be released before `complete` observes a terminal state).
    lock_held: AtomicBool,
    /// Per-core read-error counter feed; incremented on core I/O error.
    core_read_errors: Arc<AtomicU32>,
    /// The queue this request was originally dispatched onto, if any.
    /// Used to re-enqueue a resumed pass-through request to its resume
    /// handler (`ocf_queue_push_req_pt`).
    home_queue: Mutex<Option<Arc<crate::queue::Queue>>>,
}

/// A handle to a request record. Cloning is cheap (an `Arc` clone) but
/// does **not** by itself change the logical refcount — use [`Request::get`]
/// and [`Request::put`] at explicit ownership hand-off points.
#[derive(Clone)]
pub struct Request(Arc<Inner>);

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.0.id)
            .field("addr", &self.0.addr)
            .field("bytes", &self.0.bytes)
            .field("rw", &self.0.rw)
            .field("cache_mode", &self.cache_mode())
            .finish()
    }
}

impl Request {
    /// Build a new request. Starts with refcount 1, owned by the
    /// caller (mirrors the submitter's initial reference in OCF).
    #[must_use]
    pub fn new(
        addr: u64,
        bytes: u32,
        core_line_count: u32,
        rw: Direction,
        part_id: u32,
        core_read_errors: Arc<AtomicU32>,
        complete: Complete,
    ) -> Self {
        let inner = Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            bytes,
            core_line_count,
            rw,
            state: Mutex::new(State {
                cache_mode: None,
                part_id,
                seq_cutoff: false,
                force_pt: false,
                info: TraverseInfo::default(),
                engine_handler: None,
            }),
            refcount: AtomicUsize::new(1),
            complete: Mutex::new(Some(complete)),
            completed: AtomicBool::new(false),
            priv1: Mutex::new(None),
            priv_data: Mutex::new(None),
            lock_held: AtomicBool::new(false),
            core_read_errors,
            home_queue: Mutex::new(None),
        };
        Self(Arc::new(inner))
    }

    /// Records which queue this request was dispatched onto.
    pub fn set_home_queue(&self, queue: Arc<crate::queue::Queue>) {
        *self.0.home_queue.lock().unwrap() = Some(queue);
    }

    /// The queue this request was dispatched onto, if any.
    #[must_use]
    pub fn home_queue(&self) -> Option<Arc<crate::queue::Queue>> {
        self.0.home_queue.lock().unwrap().clone()
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[must_use]
    pub fn addr(&self) -> u64 {
        self.0.addr
    }

    #[must_use]
    pub fn bytes(&self) -> u32 {
        self.0.bytes
    }

    #[must_use]
    pub fn core_line_count(&self) -> u32 {
        self.0.core_line_count
    }

    #[must_use]
    pub fn rw(&self) -> Direction {
        self.0.rw
    }

    #[must_use]
    pub fn part_id(&self) -> u32 {
        self.0.state.lock().unwrap().part_id
    }

    pub fn set_part_id(&self, part_id: u32) {
        self.0.state.lock().unwrap().part_id = part_id;
    }

    #[must_use]
    pub fn cache_mode(&self) -> Option<CacheMode> {
        self.0.state.lock().unwrap().cache_mode
    }

    pub fn set_cache_mode(&self, mode: CacheMode) {
        self.0.state.lock().unwrap().cache_mode = Some(mode);
    }

    #[must_use]
    pub fn seq_cutoff(&self) -> bool {
        self.0.state.lock().unwrap().seq_cutoff
    }

    pub fn set_seq_cutoff(&self, value: bool) {
        self.0.state.lock().unwrap().seq_cutoff = value;
    }

    #[must_use]
    pub fn force_pt(&self) -> bool {
        self.0.state.lock().unwrap().force_pt
    }

    pub fn set_force_pt(&self, value: bool) {
        self.0.state.lock().unwrap().force_pt = value;
    }

    #[must_use]
    pub fn info(&self) -> TraverseInfo {
        self.0.state.lock().unwrap().info
    }

    pub fn set_info(&self, info: TraverseInfo) {
        self.0.state.lock().unwrap().info = info;
    }

    /// Clears resolved state before re-entry (the seq-cutoff-dirty-hit
    /// diversion in `read_pt` resets the request before handing it to
    /// `read_generic`).
    pub fn clear(&self) {
        let mut state = self.0.state.lock().unwrap();
        state.cache_mode = None;
        state.info = TraverseInfo::default();
        state.engine_handler = None;
    }

    /// Writes the one-shot resume continuation (a "mailbox" slot).
    pub fn set_engine_handler(&self, handler: EngineHandler) {
        self.0.state.lock().unwrap().engine_handler = Some(handler);
    }

    /// Reads and clears the resume continuation. Returns `None` if no
    /// continuation was set.
    #[must_use]
    pub fn take_engine_handler(&self) -> Option<EngineHandler> {
        self.0.state.lock().unwrap().engine_handler.take()
    }

    pub fn set_priv1(&self, value: Box<dyn Any + Send>) {
        *self.0.priv1.lock().unwrap() = Some(value);
    }

    pub fn with_priv1<R>(&self, f: impl FnOnce(Option<&(dyn Any + Send)>) -> R) -> R {
        let guard = self.0.priv1.lock().unwrap();
        f(guard.as_deref())
    }

    pub fn set_priv(&self, value: Box<dyn Any + Send>) {
        *self.0.priv_data.lock().unwrap() = Some(value);
    }

    pub fn with_priv<R>(&self, f: impl FnOnce(Option<&(dyn Any + Send)>) -> R) -> R {
        let guard = self.0.priv_data.lock().unwrap();
        f(guard.as_deref())
    }

    /// Explicit reference-count increment. Call at every hand-off:
    /// enqueue, async-lock-pending return, clean resumption.
    #[must_use]
    pub fn get(&self) -> Request {
        self.0.refcount.fetch_add(1, Ordering::AcqRel);
        Request(Arc::clone(&self.0))
    }

    /// Explicit reference-count decrement, paired with every `get`.
    /// The request is considered freeable once this reaches zero;
    /// actual deallocation is left to `Arc`'s drop glue, but callers
    /// must not touch the request again after their matching `put`.
    pub fn put(&self) {
        let prev = self.0.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "refcount underflow on request {}", self.0.id);
        log::trace!("request {} refcount now {}", self.0.id, prev - 1);
    }

    #[must_use]
    pub fn refcount(&self) -> usize {
        self.0.refcount.load(Ordering::Acquire)
    }

    /// Marks the cache-line lock as held by this request.
    pub fn mark_lock_held(&self) {
        self.0.lock_held.store(true, Ordering::Release);
    }

    /// Marks the cache-line lock as released. Must be called before
    /// `complete` is invoked with a non-retry terminal state.
    pub fn mark_lock_released(&self) {
        self.0.lock_held.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn lock_held(&self) -> bool {
        self.0.lock_held.load(Ordering::Acquire)
    }

    /// Invokes the completion callback exactly once. A non-zero
    /// core-I/O `status` additionally increments the per-core
    /// read-error counter that feeds fallback-pt.
    ///
    /// Releases the reference the entry point took on admission (see
    /// `dispatch.rs`'s four entry points): this is the `put` half of
    /// that `get`, so a request's refcount reaches zero exactly once,
    /// right after this fires, once every handler- and suspension-level
    /// reference has also been released.
    pub fn complete(&self, status: i32) {
        debug_assert!(
            !self.lock_held(),
            "request {} completed while a cache-line lock is still held",
            self.0.id
        );
        let cb = self.0.complete.lock().unwrap().take();
        match cb {
            Some(cb) => {
                let already = self.0.completed.swap(true, Ordering::AcqRel);
                debug_assert!(!already, "request {} completed twice", self.0.id);
                cb(self, status);
                self.put();
            }
            None => {
                log::error!(
                    "request {} complete() called more than once (status={status})",
                    self.0.id
                );
            }
        }
    }

    /// Records a core device read error against the per-core counter
    /// that feeds the fallback-pt mechanism.
    pub fn record_core_read_error(&self) {
        self.0.core_read_errors.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    fn dummy_request(complete_count: Arc<AtomicI32>) -> Request {
        let errors = Arc::new(AtomicU32::new(0));
        Request::new(
            0,
            4096,
            1,
            Direction::Read,
            0,
            errors,
            Box::new(move |_req, _status| {
                complete_count.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn complete_invokes_callback_exactly_once() {
        let count = Arc::new(AtomicI32::new(0));
        let req = dummy_request(count.clone());
        req.complete(0);
        req.complete(0); // should be a no-op (logged), not a second callback
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refcount_tracks_get_put() {
        let count = Arc::new(AtomicI32::new(0));
        let req = dummy_request(count);
        assert_eq!(req.refcount(), 1);
        let clone = req.get();
        assert_eq!(req.refcount(), 2);
        clone.put();
        assert_eq!(req.refcount(), 1);
        req.put();
        assert_eq!(req.refcount(), 0);
    }

    #[test]
    fn clear_resets_resolved_state() {
        let count = Arc::new(AtomicI32::new(0));
        let req = dummy_request(count);
        req.set_cache_mode(CacheMode::Pt);
        req.set_info(TraverseInfo {
            dirty_any: true,
            hit_no: 3,
            mapped_count: 4,
        });
        req.clear();
        assert_eq!(req.cache_mode(), None);
        assert_eq!(req.info(), TraverseInfo::default());
    }
}
