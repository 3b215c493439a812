//! The dispatcher: resolves each request's effective cache mode (or
//! honors a caller-forced pass-through), records it against the stats
//! block, and hands it to the (mode, direction) handler from a fixed
//! table. Four entry points mirror
//! `ocf_core_submit_io`/`ocf_core_submit_io_fast`/`ocf_core_submit_flush`/
//! `ocf_core_submit_discard`.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::core_device::CoreDevice;
use crate::engine::pt::{read_pt, write_pt};
use crate::engine::EngineContext;
use crate::error::Error;
use crate::mode::{resolve_effective_cache_mode, CacheMode};
use crate::queue::{PushFlags, QueueFabric};
use crate::request::{Direction, Request};

/// A handler bound to one `(CacheMode, Direction)` pair. Plain function
/// pointers, not trait objects: every handler is a free function
/// closing over nothing but its `EngineContext` parameter, so the
/// dispatch table can be a `'static` lookup built once.
pub type HandlerFn = fn(Arc<EngineContext>, Request);

fn read_generic(ctx: Arc<EngineContext>, req: Request) {
    log::trace!("request {}: generic cache-aware read (stand-in)", req.id());
    let ctx_for_complete = Arc::clone(&ctx);
    ctx.core_io.submit_read(
        &req,
        Box::new(move |req, result| complete_from_core_result(&ctx_for_complete, req, result)),
    );
}

fn write_through(ctx: Arc<EngineContext>, req: Request) {
    forward_write(ctx, req, "write-through");
}

fn write_back(ctx: Arc<EngineContext>, req: Request) {
    forward_write(ctx, req, "write-back");
}

fn write_around(ctx: Arc<EngineContext>, req: Request) {
    forward_write(ctx, req, "write-around");
}

fn write_invalidate(ctx: Arc<EngineContext>, req: Request) {
    forward_write(ctx, req, "write-invalidate");
}

fn read_write_only(ctx: Arc<EngineContext>, req: Request) {
    log::trace!("request {}: write-only read (stand-in)", req.id());
    let ctx_for_complete = Arc::clone(&ctx);
    ctx.core_io.submit_read(
        &req,
        Box::new(move |req, result| complete_from_core_result(&ctx_for_complete, req, result)),
    );
}

fn write_write_only(ctx: Arc<EngineContext>, req: Request) {
    forward_write(ctx, req, "write-only");
}

/// Outcome of a synchronous fast-path attempt, mirroring
/// `ocf_engine_hndl_fast_req`'s tri-state return: the fast handler
/// either completes the request inline (asynchronously, via the usual
/// `complete` callback) or declines with no partial state, leaving the
/// caller to resubmit through the standard path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPath {
    /// Accepted; the request will complete via the handler it was just
    /// handed to.
    Yes,
    /// Declined with no partial state. The caller must resubmit via
    /// [`Dispatcher::handle_request`]; the reference this path took is
    /// already released.
    No,
    /// A negative status; the request has already been completed with it.
    Error(i32),
}

/// The fast path only ever applies to a request whose cache lines are
/// already fully mapped (no allocation/eviction needed); anything else
/// declines so the caller falls back to the standard, cache-aware path.
fn read_fast(ctx: &Arc<EngineContext>, req: &Request) -> FastPath {
    {
        let _guard = ctx.hash_locks.lock_rd();
        ctx.traverse.traverse(req);
    }
    if req.info().mapped_count < req.core_line_count() {
        log::trace!("request {}: fast read declines, not fully mapped", req.id());
        return FastPath::No;
    }
    log::trace!("request {}: fast read path (stand-in)", req.id());
    let ctx_for_complete = Arc::clone(ctx);
    ctx.core_io.submit_read(
        req,
        Box::new(move |req, result| complete_from_core_result(&ctx_for_complete, req, result)),
    );
    FastPath::Yes
}

fn write_fast(ctx: &Arc<EngineContext>, req: &Request) -> FastPath {
    {
        let _guard = ctx.hash_locks.lock_rd();
        ctx.traverse.traverse(req);
    }
    if req.info().mapped_count < req.core_line_count() {
        log::trace!("request {}: fast write declines, not fully mapped", req.id());
        return FastPath::No;
    }
    log::trace!("request {}: fast write (stand-in)", req.id());
    let ctx_for_complete = Arc::clone(ctx);
    ctx.core_io.submit_write(
        req,
        Box::new(move |req, result| complete_from_core_result(&ctx_for_complete, req, result)),
    );
    FastPath::Yes
}

fn forward_write(ctx: Arc<EngineContext>, req: Request, kind: &'static str) {
    log::trace!("request {}: {kind} write (stand-in)", req.id());
    let ctx_for_complete = Arc::clone(&ctx);
    ctx.core_io.submit_write(
        &req,
        Box::new(move |req, result| complete_from_core_result(&ctx_for_complete, req, result)),
    );
}

/// Shared by every non-pass-through handler's core-I/O completion: a
/// core error feeds both the per-core counter (`record_core_read_error`)
/// and the cache-wide fallback-pt counter, mirroring what
/// `engine/pt.rs`'s `forward` does for the pass-through path — the
/// fallback-pt feedback loop must see errors regardless of which mode
/// routed the request to the core device.
fn complete_from_core_result(ctx: &Arc<EngineContext>, req: Request, result: Result<(), i32>) {
    match result {
        Ok(()) => req.complete(0),
        Err(status) => {
            req.record_core_read_error();
            ctx.cache.record_cache_device_error();
            ctx.stats.record_core_error();
            req.complete(status);
        }
    }
}

/// The real engines the real system would bind for each non-pt mode
/// (write allocation, metadata-driven hit/miss handling, and so on) are
/// out of scope; every slot but pass-through's is a stand-in that
/// forwards straight to the core device, tagged with which mode it
/// stood in for so dispatch behavior stays observable in logs.
static HANDLERS: Lazy<HashMap<(CacheMode, Direction), HandlerFn>> = Lazy::new(|| {
    let mut m: HashMap<(CacheMode, Direction), HandlerFn> = HashMap::new();
    m.insert((CacheMode::Pt, Direction::Read), read_pt_adapter);
    m.insert((CacheMode::Pt, Direction::Write), write_pt_adapter);
    m.insert((CacheMode::Wt, Direction::Read), read_generic);
    m.insert((CacheMode::Wt, Direction::Write), write_through);
    m.insert((CacheMode::Wb, Direction::Read), read_generic);
    m.insert((CacheMode::Wb, Direction::Write), write_back);
    m.insert((CacheMode::Wa, Direction::Read), read_generic);
    m.insert((CacheMode::Wa, Direction::Write), write_around);
    m.insert((CacheMode::Wi, Direction::Read), read_generic);
    m.insert((CacheMode::Wi, Direction::Write), write_invalidate);
    m.insert((CacheMode::Wo, Direction::Read), read_write_only);
    m.insert((CacheMode::Wo, Direction::Write), write_write_only);
    m.insert((CacheMode::Fast, Direction::Read), read_fast_table_adapter);
    m.insert((CacheMode::Fast, Direction::Write), write_fast_table_adapter);
    m
});

/// `fast` is only reachable through [`Dispatcher::handle_fast_request`]
/// in practice (the mode resolver never resolves to it), but the
/// dispatch table stays a total function over every `(mode, direction)`
/// pair, so a decline here — which should never happen via the normal
/// path — still resolves to a definite completion rather than a hang.
fn read_fast_table_adapter(ctx: Arc<EngineContext>, req: Request) {
    match read_fast(&ctx, &req) {
        FastPath::Yes => {}
        FastPath::No => req.complete(Error::Invalid.status()),
        FastPath::Error(status) => req.complete(status),
    }
}

fn write_fast_table_adapter(ctx: Arc<EngineContext>, req: Request) {
    match write_fast(&ctx, &req) {
        FastPath::Yes => {}
        FastPath::No => req.complete(Error::Invalid.status()),
        FastPath::Error(status) => req.complete(status),
    }
}

fn read_pt_adapter(ctx: Arc<EngineContext>, req: Request) {
    read_pt(ctx, req);
}

fn write_pt_adapter(ctx: Arc<EngineContext>, req: Request) {
    write_pt(ctx, req);
}

fn lookup_handler(mode: CacheMode, rw: Direction) -> Option<HandlerFn> {
    HANDLERS.get(&(mode, rw)).copied()
}

/// Builds the shared `EngineContext` used by every dispatched request,
/// wiring the seq-cutoff-dirty-hit diversion back into the generic read
/// handler above without needing the context to already exist.
#[must_use]
pub fn build_engine_context(
    lock_mgr: Arc<dyn crate::concurrency::LineLockManager>,
    hash_locks: Arc<crate::concurrency::HashBucketLocks>,
    traverse: Arc<dyn crate::traverse::TraverseService>,
    core_io: Arc<dyn crate::engine::CoreIoSubmitter>,
    cache: Arc<crate::cache::Cache>,
    stats: Arc<crate::stats::Stats>,
) -> Arc<EngineContext> {
    Arc::new_cyclic(|weak| {
        let weak = weak.clone();
        EngineContext {
            lock_mgr,
            hash_locks,
            traverse,
            core_io,
            cache,
            stats,
            redirect_to_generic_read: Box::new(move |req| match weak.upgrade() {
                Some(ctx) => read_generic(ctx, req),
                None => req.complete(Error::Invalid.status()),
            }),
        }
    })
}

/// Resolves requests, forwards them to the matching handler, and
/// enqueues/dispatches through the queue fabric.
pub struct Dispatcher {
    engine_ctx: Arc<EngineContext>,
    queues: Arc<QueueFabric>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(engine_ctx: Arc<EngineContext>, queues: Arc<QueueFabric>) -> Self {
        Self { engine_ctx, queues }
    }

    /// `ocf_core_submit_io`: resolve the effective mode (or honor
    /// `force_pt`), then dispatch.
    pub fn handle_request(&self, core: Arc<CoreDevice>, req: Request, queue_index: usize) {
        let queue = self.queues.queue(queue_index);
        req.set_home_queue(Arc::clone(&queue));
        let engine_ctx = Arc::clone(&self.engine_ctx);
        req.set_engine_handler(Box::new(move |req| {
            resolve_and_dispatch(engine_ctx, core, req);
        }));
        queue.push(req, PushFlags::ALLOW_SYNC);
    }

    /// `ocf_core_submit_io_fast`: the caller asserts the optimistic fast
    /// path applies. No mode resolution, no queue hop — the fast
    /// handler is invoked synchronously and its tri-state outcome is
    /// returned directly so the caller can retry via the standard path
    /// on `FastPath::No`.
    pub fn handle_fast_request(&self, req: Request) -> FastPath {
        req.set_cache_mode(CacheMode::Fast);
        self.engine_ctx
            .stats
            .record_dispatch(req.part_id(), req.rw() == Direction::Write);
        let outcome = match req.rw() {
            Direction::Read => read_fast(&self.engine_ctx, &req),
            Direction::Write => write_fast(&self.engine_ctx, &req),
        };
        match outcome {
            FastPath::Yes => {}
            FastPath::No => req.put(),
            FastPath::Error(status) => req.complete(status),
        }
        outcome
    }

    /// `ocf_core_submit_flush`: maintenance op, forwarded to the core
    /// device regardless of resolved mode.
    pub fn handle_flush_request(&self, req: Request, queue_index: usize) {
        let queue = self.queues.queue(queue_index);
        req.set_home_queue(Arc::clone(&queue));
        let engine_ctx = Arc::clone(&self.engine_ctx);
        req.set_engine_handler(Box::new(move |req| {
            let ctx_for_complete = Arc::clone(&engine_ctx);
            engine_ctx.core_io.submit_flush(
                &req,
                Box::new(move |req, result| complete_from_core_result(&ctx_for_complete, req, result)),
            );
        }));
        queue.push(req, PushFlags::ALLOW_SYNC);
    }

    /// `ocf_core_submit_discard`: discard never waits for line locks, so
    /// unlike every other entry point it is invoked synchronously and
    /// never touches the queue fabric.
    pub fn handle_discard_request(&self, req: Request) {
        let ctx_for_complete = Arc::clone(&self.engine_ctx);
        self.engine_ctx.core_io.submit_discard(
            &req,
            Box::new(move |req, result| complete_from_core_result(&ctx_for_complete, req, result)),
        );
    }
}

fn resolve_and_dispatch(ctx: Arc<EngineContext>, core: Arc<CoreDevice>, req: Request) {
    if req.force_pt() {
        log::debug!("request {}: force_pt set, skipping resolver", req.id());
        req.set_cache_mode(CacheMode::Pt);
    } else {
        resolve_effective_cache_mode(&ctx.cache, &core, &req);
    }

    let mode = match req.cache_mode() {
        Some(mode) => mode,
        None => {
            log::error!("request {}: no cache mode resolved", req.id());
            req.complete(Error::Invalid.status());
            return;
        }
    };

    ctx.stats.record_dispatch(req.part_id(), req.rw() == Direction::Write);

    match lookup_handler(mode, req.rw()) {
        Some(handler) => handler(ctx, req),
        None => {
            log::error!(
                "request {}: no handler registered for mode {:?} direction {:?}",
                req.id(),
                mode,
                req.rw()
            );
            req.complete(Error::Invalid.status());
        }
    }
}
