//! Pass-through read/write path: hash/traverse under a read lock,
//! divert a dirty hit away from pass-through under sequential cutoff,
//! acquire the cache-line lock asynchronously, repartition and clean
//! under the hash-bucket locks, then forward to the core device.
//!
//! The clean submission runs under the hash-bucket *read* lock
//! (`ocf_hb_req_prot_lock_rd`), not a write lock — repartitioning is
//! the one step that takes the write lock.

use std::sync::Arc;

use crate::concurrency::LockResult;
use crate::engine::EngineContext;
use crate::queue::PushFlags;
use crate::request::{Direction, Request};

/// Entry point for a read dispatched in pass-through mode.
///
/// Holds its own reference for the duration of this call ("each handler
/// takes one on entry and drops one on exit"), independent of the
/// entry point's own reference and of whatever suspension-level
/// reference a pending lock or clean hands off to.
pub fn read_pt(ctx: Arc<EngineContext>, req: Request) {
    req.get();
    {
        let _guard = ctx.hash_locks.lock_rd();
        ctx.traverse.traverse(&req);
    }

    // A sequential-cutoff resolution that lands on an all-dirty hit
    // would return stale bytes if served straight through pass-through;
    // divert it back to the generic (cache-aware) read path instead,
    // unless the caller explicitly forced pass-through.
    if req.seq_cutoff() && !req.force_pt() && ctx.traverse.is_dirty_all(&req) {
        log::debug!(
            "request {}: seq-cutoff pass-through hit dirty data, diverting to generic read",
            req.id()
        );
        req.clear();
        (ctx.redirect_to_generic_read)(req.clone());
        req.put();
        return;
    }

    lock_and_continue(ctx, req.clone(), false);
    req.put();
}

/// Entry point for a write dispatched in pass-through mode. Same
/// handler-level refcount discipline as [`read_pt`].
pub fn write_pt(ctx: Arc<EngineContext>, req: Request) {
    req.get();
    {
        let _guard = ctx.hash_locks.lock_rd();
        ctx.traverse.traverse(&req);
    }
    lock_and_continue(ctx, req.clone(), true);
    req.put();
}

fn lock_and_continue(ctx: Arc<EngineContext>, req: Request, is_write: bool) {
    // Nothing is mapped for this request, so there are no cache lines
    // to protect: skip the lock entirely rather than serializing
    // unrelated pass-through requests on it.
    if req.info().mapped_count == 0 {
        after_lock(ctx, req, is_write);
        return;
    }

    let ctx_for_resume = Arc::clone(&ctx);
    let result = ctx.lock_mgr.async_lock_rd(
        &req,
        Box::new(move |resumed| resume_after_lock(ctx_for_resume, resumed, is_write)),
    );
    match result {
        LockResult::Acquired => after_lock(ctx, req, is_write),
        LockResult::Pending(ticket) => {
            log::trace!("request {}: cache-line lock pending, ticket {ticket}", req.id());
        }
        LockResult::Error(status) => {
            log::warn!("request {}: cache-line lock failed, status {status}", req.id());
            req.complete(status);
        }
    }
}

/// Runs on whatever thread released the contended line. Requeues onto
/// the request's home queue so the rest of the pipeline runs on the
/// same worker thread the request was originally dispatched to,
/// mirroring `ocf_queue_push_req_pt`.
fn resume_after_lock(ctx: Arc<EngineContext>, req: Request, is_write: bool) {
    match req.home_queue() {
        Some(queue) => {
            req.set_engine_handler(Box::new(move |req| after_lock(ctx, req, is_write)));
            queue.push(req, PushFlags::ALLOW_SYNC);
        }
        None => after_lock(ctx, req, is_write),
    }
}

/// `read_pt_do`: increments the refcount on entry and decrements on
/// exit (this function's own exit, synchronously — not the eventual
/// completion of whatever it hands off to), so the suspended clean
/// path above can hold its own independent reference.
fn after_lock(ctx: Arc<EngineContext>, req: Request, is_write: bool) {
    req.get();

    if ctx.traverse.needs_repart(&req) {
        let _guard = ctx.hash_locks.lock_wr();
        ctx.traverse.user_part_move(&req);
    }

    if req.info().dirty_any {
        let ctx_for_clean = Arc::clone(&ctx);
        // The read lock only needs to be held while the clean is being
        // submitted, not across its (async) completion.
        let _guard = ctx.hash_locks.lock_rd();
        ctx.traverse.clean(
            &req,
            Box::new(move |req, result| match result {
                Ok(()) => forward(ctx_for_clean, req, is_write),
                Err(status) => {
                    log::warn!("request {}: clean failed, status {status}", req.id());
                    ctx_for_clean.stats.record_clean_error();
                    ctx_for_clean.lock_mgr.unlock(&req);
                    req.complete(status);
                }
            }),
        );
    } else {
        forward(ctx, req.clone(), is_write);
    }

    req.put();
}

fn forward(ctx: Arc<EngineContext>, req: Request, is_write: bool) {
    let ctx_for_complete = Arc::clone(&ctx);
    let on_complete: Box<dyn FnOnce(Request, Result<(), i32>) + Send> =
        Box::new(move |req, result| {
            if is_write {
                // Pass-through writes bypass the cache; drop any stale
                // mapping so a later hit cannot read around the write.
                ctx_for_complete.traverse.invalidate(&req);
            }
            // Stats are updated after the core I/O has actually
            // completed, not on dispatch, and before the cache-line
            // lock is released.
            ctx_for_complete.stats.record_pass_through(req.part_id(), is_write);
            ctx_for_complete.lock_mgr.unlock(&req);
            match result {
                Ok(()) => req.complete(0),
                Err(status) => {
                    req.record_core_read_error();
                    ctx_for_complete.cache.record_cache_device_error();
                    ctx_for_complete.stats.record_core_error();
                    req.complete(status);
                }
            }
        });

    match req.rw() {
        Direction::Read => ctx.core_io.submit_read(&req, on_complete),
        Direction::Write if is_write => ctx.core_io.submit_write(&req, on_complete),
        Direction::Write => ctx.core_io.submit_read(&req, on_complete),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheBuilder;
    use crate::concurrency::{HashBucketLocks, InProcessLineLockManager};
    use crate::config::CacheConfig;
    use crate::engine::InMemoryCoreIo;
    use crate::stats::Stats;
    use crate::traverse::{InProcessTraverseService, TraverseService};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    fn make_ctx(traverse: Arc<InProcessTraverseService>) -> Arc<EngineContext> {
        let cache = CacheBuilder::new(CacheConfig::default()).build();
        Arc::new(EngineContext {
            lock_mgr: Arc::new(InProcessLineLockManager::new()),
            hash_locks: Arc::new(HashBucketLocks::new()),
            traverse,
            core_io: Arc::new(InMemoryCoreIo),
            cache: Arc::new(cache),
            stats: Arc::new(Stats::new()),
            redirect_to_generic_read: Box::new(|req| req.complete(0)),
        })
    }

    fn request(addr: u64, rw: Direction, on_status: impl FnOnce(i32) + Send + 'static) -> Request {
        Request::new(
            addr,
            4096,
            1,
            rw,
            0,
            Arc::new(AtomicU32::new(0)),
            Box::new(move |_req, status| on_status(status)),
        )
    }

    #[test]
    fn clean_read_completes_successfully() {
        let ctx = make_ctx(Arc::new(InProcessTraverseService::new()));
        let (tx, rx) = channel();
        let req = request(0, Direction::Read, move |status| tx.send(status).unwrap());
        read_pt(ctx, req);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
    }

    #[test]
    fn dirty_hit_under_seq_cutoff_diverts_to_generic_read() {
        let traverse = Arc::new(InProcessTraverseService::new());
        traverse.set_line(0, true, true);
        let ctx = make_ctx(traverse);
        let (tx, rx) = channel();
        let req = request(0, Direction::Read, move |status| tx.send(status).unwrap());
        req.set_seq_cutoff(true);
        read_pt(ctx, req);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
    }

    #[test]
    fn dirty_hit_without_seq_cutoff_cleans_then_forwards() {
        let traverse = Arc::new(InProcessTraverseService::new());
        traverse.set_line(0, true, true);
        let ctx = make_ctx(traverse);
        let (tx, rx) = channel();
        let req = request(0, Direction::Read, move |status| tx.send(status).unwrap());
        read_pt(ctx, req);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
    }

    #[test]
    fn write_pass_through_invalidates_mapping_after_forward() {
        let traverse = Arc::new(InProcessTraverseService::new());
        let ctx = make_ctx(Arc::clone(&traverse));
        let (tx, rx) = channel();
        let req = request(0, Direction::Write, move |status| tx.send(status).unwrap());
        write_pt(ctx, req);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
        assert!(!traverse.is_dirty_all(&request(0, Direction::Read, |_| {})));
    }

    #[test]
    fn refcount_returns_to_zero_after_completion_through_a_suspended_clean() {
        let traverse = Arc::new(InProcessTraverseService::new());
        traverse.set_line(0, true, true);
        let ctx = make_ctx(traverse);
        let (tx, rx) = channel();
        let req = request(0, Direction::Read, move |status| tx.send(status).unwrap());
        let handle = req.clone();
        read_pt(ctx, req);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
        assert_eq!(handle.refcount(), 0);
    }

    #[test]
    fn refcount_returns_to_zero_after_completion_via_pending_lock() {
        // Issue a write and, before it can complete (and release the
        // line), a read against the same line: the read's async lock
        // acquisition must come back `Pending` and resume later. Both
        // requests need a mapped line or the lock is skipped entirely
        // (unmapped requests have nothing to protect).
        let traverse = Arc::new(InProcessTraverseService::new());
        traverse.set_line(0, true, false);
        let ctx = make_ctx(traverse);
        let (tx1, rx1) = channel();
        let first = request(0, Direction::Write, move |status| tx1.send(status).unwrap());
        write_pt(Arc::clone(&ctx), first);

        let (tx2, rx2) = channel();
        let second = request(0, Direction::Read, move |status| tx2.send(status).unwrap());
        let handle = second.clone();
        read_pt(ctx, second);

        assert_eq!(rx1.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
        assert_eq!(rx2.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
        assert_eq!(handle.refcount(), 0);
    }

    #[test]
    fn force_pt_overrides_the_seq_cutoff_dirty_diversion() {
        // An all-dirty seq-cutoff hit would normally divert to the
        // generic read path, but force_pt is an explicit override: it
        // must still be served straight through pass-through, i.e. the
        // diversion closure must not run at all.
        let traverse = Arc::new(InProcessTraverseService::new());
        traverse.set_line(0, true, true);
        let cache = CacheBuilder::new(CacheConfig::default()).build();
        let diverted = Arc::new(AtomicBool::new(false));
        let diverted_check = Arc::clone(&diverted);
        let ctx = Arc::new(EngineContext {
            lock_mgr: Arc::new(InProcessLineLockManager::new()),
            hash_locks: Arc::new(HashBucketLocks::new()),
            traverse,
            core_io: Arc::new(InMemoryCoreIo),
            cache: Arc::new(cache),
            stats: Arc::new(Stats::new()),
            redirect_to_generic_read: Box::new(move |req| {
                diverted_check.store(true, Ordering::Release);
                req.complete(0);
            }),
        });
        let (tx, rx) = channel();
        let req = request(0, Direction::Read, move |status| tx.send(status).unwrap());
        req.set_seq_cutoff(true);
        req.set_force_pt(true);
        read_pt(ctx, req);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
        assert!(!diverted.load(Ordering::Acquire));
    }

    struct PanicsIfCalledLockManager;

    impl crate::concurrency::LineLockManager for PanicsIfCalledLockManager {
        fn async_lock_rd(
            &self,
            _req: &Request,
            _on_resume: Box<dyn FnOnce(Request) + Send>,
        ) -> LockResult {
            panic!("cache-line lock manager must not be consulted for an unmapped request");
        }

        fn unlock(&self, _req: &Request) {}
    }

    #[test]
    fn unmapped_request_never_consults_the_lock_manager() {
        let cache = CacheBuilder::new(CacheConfig::default()).build();
        let ctx = Arc::new(EngineContext {
            lock_mgr: Arc::new(PanicsIfCalledLockManager),
            hash_locks: Arc::new(HashBucketLocks::new()),
            traverse: Arc::new(InProcessTraverseService::new()),
            core_io: Arc::new(InMemoryCoreIo),
            cache: Arc::new(cache),
            stats: Arc::new(Stats::new()),
            redirect_to_generic_read: Box::new(|req| req.complete(0)),
        });
        let (tx, rx) = channel();
        let req = request(0, Direction::Read, move |status| tx.send(status).unwrap());
        read_pt(ctx, req);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
    }
}
