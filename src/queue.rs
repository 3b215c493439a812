//! Queue fabric: a per-queue FIFO of requests, each queue drained by
//! one worker thread. Generalizes a single-threaded, cycle-driven
//! `Fifo<Packet<...>>` drain loop (`mem_sub_partition.rs::cycle`) to a
//! worker-thread-per-queue model, since this core dispatches requests
//! concurrently rather than stepping a simulation clock.

use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crate::request::{EngineHandler, Request};

/// Push flags: may combine `ALLOW_SYNC` (inline dispatch permitted
/// when the caller is already running on the target queue's worker
/// thread) and `PRIO_HIGH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushFlags(u8);

impl PushFlags {
    pub const NONE: PushFlags = PushFlags(0);
    pub const ALLOW_SYNC: PushFlags = PushFlags(1 << 0);
    pub const PRIO_HIGH: PushFlags = PushFlags(1 << 1);

    #[must_use]
    pub fn contains(self, other: PushFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PushFlags {
    type Output = PushFlags;
    fn bitor(self, rhs: PushFlags) -> PushFlags {
        PushFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Priority {
    Normal,
    High,
}

/// What one queued slot runs: a request's `engine_handler`, or a bare
/// closure (the shape the parallelizer needs to fan work out across
/// queues without a request attached to it).
enum Job {
    Request(Request),
    Closure(Box<dyn FnOnce() + Send>),
}

struct QueueItem {
    priority: Priority,
    seq: u64,
    job: Job,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first; within a priority, lower seq (older)
        // first, so reverse seq ordering for a max-heap.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

thread_local! {
    static CURRENT_QUEUE: Cell<Option<usize>> = Cell::new(None);
}

/// One dispatch queue: a FIFO of requests drained by a single worker
/// thread that invokes each request's `engine_handler` continuation.
pub struct Queue {
    id: usize,
    sender: Sender<QueueItem>,
    seq: AtomicU64,
    worker_thread_id: ThreadId,
    _worker: JoinHandle<()>,
}

impl Queue {
    fn spawn(id: usize) -> Self {
        let (tx, rx): (Sender<QueueItem>, Receiver<QueueItem>) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel::<ThreadId>();
        let worker = thread::Builder::new()
            .name(format!("dispatch-queue-{id}"))
            .spawn(move || {
                ready_tx.send(thread::current().id()).ok();
                CURRENT_QUEUE.with(|c| c.set(Some(id)));
                worker_loop(id, &rx);
            })
            .expect("failed to spawn dispatch queue worker thread");
        let worker_thread_id = ready_rx
            .recv()
            .expect("worker thread did not report its id");
        Self {
            id,
            sender: tx,
            seq: AtomicU64::new(0),
            worker_thread_id,
            _worker: worker,
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// `queue_push_req`: enqueue `req`, or — if `ALLOW_SYNC` is set and
    /// we are already running on this queue's worker thread — dispatch
    /// its `engine_handler` inline.
    pub fn push(&self, req: Request, flags: PushFlags) {
        self.push_job(Job::Request(req), flags);
    }

    /// `queue_push_req_cb`: enqueue with a one-shot handler override.
    pub fn push_cb(&self, req: Request, handler: EngineHandler, flags: PushFlags) {
        req.set_engine_handler(handler);
        self.push(req, flags);
    }

    /// Enqueues a bare closure rather than a request, used by the
    /// parallelizer to fan shard work out across the queue fabric.
    pub fn push_closure(&self, job: Box<dyn FnOnce() + Send>, flags: PushFlags) {
        self.push_job(Job::Closure(job), flags);
    }

    fn push_job(&self, job: Job, flags: PushFlags) {
        let on_worker_thread = thread::current().id() == self.worker_thread_id;
        if flags.contains(PushFlags::ALLOW_SYNC) && on_worker_thread {
            log::trace!("queue {}: inline dispatch", self.id);
            run_job(job);
            return;
        }

        let priority = if flags.contains(PushFlags::PRIO_HIGH) {
            Priority::High
        } else {
            Priority::Normal
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let item = QueueItem { priority, seq, job };
        if self.sender.send(item).is_err() {
            log::error!("queue {} worker thread is gone, dropping push", self.id);
        }
    }
}

fn run_job(job: Job) {
    match job {
        Job::Request(req) => run_handler(req),
        Job::Closure(f) => f(),
    }
}

fn run_handler(req: Request) {
    match req.take_engine_handler() {
        Some(handler) => handler(req),
        None => {
            log::error!(
                "request {} dequeued with no engine_handler set",
                req.id()
            );
            req.complete(crate::error::Error::Invalid.status());
        }
    }
}

fn worker_loop(id: usize, rx: &Receiver<QueueItem>) {
    // Drain everything currently buffered into a local heap so
    // high-priority pushes jump ahead of already-queued normal ones,
    // then block for the next item once the heap runs dry.
    let mut heap: BinaryHeap<QueueItem> = BinaryHeap::new();
    loop {
        if heap.is_empty() {
            match rx.recv() {
                Ok(item) => heap.push(item),
                Err(_) => {
                    log::debug!("queue {id}: sender dropped, worker exiting");
                    return;
                }
            }
        }
        while let Ok(item) = rx.try_recv() {
            heap.push(item);
        }
        if let Some(item) = heap.pop() {
            run_job(item.job);
        }
    }
}

/// A fixed collection of dispatch queues plus a management queue used
/// when no I/O queues are configured: if there are no I/O queues, all
/// shards bind to the management queue.
pub struct QueueFabric {
    queues: Vec<Arc<Queue>>,
    mngt_queue: Arc<Queue>,
}

impl QueueFabric {
    #[must_use]
    pub fn new(num_queues: usize) -> Self {
        let queues = (0..num_queues).map(|id| Arc::new(Queue::spawn(id))).collect();
        let mngt_queue = Arc::new(Queue::spawn(num_queues));
        Self { queues, mngt_queue }
    }

    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Resolves a queue index modulo the fabric's queue count, or the
    /// management queue if the fabric has no I/O queues configured (the
    /// same fallback the parallelizer applies per-shard).
    #[must_use]
    pub fn queue(&self, index: usize) -> Arc<Queue> {
        if self.queues.is_empty() {
            return Arc::clone(&self.mngt_queue);
        }
        Arc::clone(&self.queues[index % self.queues.len()])
    }

    #[must_use]
    pub fn queues(&self) -> &[Arc<Queue>] {
        &self.queues
    }

    #[must_use]
    pub fn management_queue(&self) -> Arc<Queue> {
        Arc::clone(&self.mngt_queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Direction;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn pushed_request_runs_its_handler() {
        let fabric = QueueFabric::new(1);
        let queue = fabric.queue(0);
        let (tx, rx) = channel::<()>();
        let req = Request::new(
            0,
            4096,
            1,
            Direction::Read,
            0,
            Arc::new(AtomicU32::new(0)),
            Box::new(|_, _| {}),
        );
        req.set_engine_handler(Box::new(move |_req| {
            tx.send(()).unwrap();
        }));
        queue.push(req, PushFlags::NONE);
        rx.recv_timeout(Duration::from_secs(2))
            .expect("handler did not run");
    }

    #[test]
    fn high_priority_push_is_accepted() {
        let fabric = QueueFabric::new(1);
        let queue = fabric.queue(0);
        let (tx, rx) = channel::<u32>();
        for i in 0..3u32 {
            let tx = tx.clone();
            let req = Request::new(
                0,
                4096,
                1,
                Direction::Read,
                0,
                Arc::new(AtomicU32::new(0)),
                Box::new(|_, _| {}),
            );
            req.set_engine_handler(Box::new(move |_req| {
                tx.send(i).unwrap();
            }));
            let flags = if i == 2 {
                PushFlags::PRIO_HIGH
            } else {
                PushFlags::NONE
            };
            queue.push(req, flags);
        }
        let mut seen = vec![];
        for _ in 0..3 {
            seen.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&2));
    }

    #[test]
    fn pushed_closure_runs_on_the_worker_thread() {
        let fabric = QueueFabric::new(1);
        let queue = fabric.queue(0);
        let (tx, rx) = channel::<()>();
        queue.push_closure(
            Box::new(move || {
                tx.send(()).unwrap();
            }),
            PushFlags::NONE,
        );
        rx.recv_timeout(Duration::from_secs(2))
            .expect("closure did not run");
    }
}

