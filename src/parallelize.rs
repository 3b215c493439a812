//! Fan-out/fan-in helper for splitting one operation into independent
//! shards run across the queue fabric. Grounded on
//! `utils_parallelize.c`'s shard-counting scheme: `remaining` starts at
//! `shard_count + 1` so the loop that launches every shard can finish
//! launching before any shard's completion is allowed to trigger
//! `finish`, and the first non-zero shard status wins via a
//! compare-and-swap against a zero sentinel.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::queue::{PushFlags, QueueFabric};

/// Cache-line alignment for the caller-sized scratch area handed to
/// every shard; matches the line granularity the rest of the crate
/// locks and traverses at.
const PRIV_ALIGN: usize = 64;

/// A zeroed, 64-byte-aligned scratch buffer allocated once per `run()`
/// call and shared (read/write, unsynchronized between shards) across
/// every shard closure. Callers that need per-shard partitioning of it
/// are responsible for dividing `shard_total` slices out of it
/// themselves; this type only owns the allocation.
pub struct PrivArea {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for PrivArea {}
unsafe impl Sync for PrivArea {}

impl PrivArea {
    fn alloc(size: u32) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size as usize, PRIV_ALIGN).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        Some(Self { ptr, layout })
    }

    /// Raw pointer to the start of the scratch area. Valid for the
    /// lifetime of this `PrivArea` (held alive by the `Arc` every shard
    /// closure clones).
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for PrivArea {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Per-shard work: shard index, total shard count, and a handle to the
/// caller-sized `priv` area (`None` if `priv_size` was 0). Returns a
/// status (0 for success, non-zero for error), the same convention
/// [`crate::request::Request::complete`] uses.
pub type ShardFn = Arc<dyn Fn(u32, u32, Option<&PrivArea>) -> i32 + Send + Sync>;

/// Called exactly once, after every shard has run, with the first
/// non-zero shard status (or 0 if every shard succeeded).
pub type FinishFn = Box<dyn FnOnce(i32) + Send>;

/// Splits work into `shard_count` independent pieces, round-robins them
/// across the queue fabric's worker threads, and calls `finish` once
/// every shard has completed.
pub struct Parallelizer {
    queues: Arc<QueueFabric>,
}

impl Parallelizer {
    #[must_use]
    pub fn new(queues: Arc<QueueFabric>) -> Self {
        Self { queues }
    }

    /// Runs `shard_fn(i, shard_count, priv_area)` for `i in
    /// 0..shard_count`, one shard per queue (round-robin if there are
    /// fewer queues than shards; all shards bind to the management
    /// queue if the fabric has none). `priv_size` bytes are allocated
    /// once, zeroed and 64-byte aligned, and shared across every shard
    /// (`None` if `priv_size` is 0).
    pub fn run(&self, shard_count: u32, priv_size: u32, shard_fn: ShardFn, finish: FinishFn) {
        if shard_count == 0 {
            finish(0);
            return;
        }

        let remaining = Arc::new(AtomicU32::new(shard_count + 1));
        let first_error = Arc::new(AtomicI32::new(0));
        let finish = Arc::new(Mutex::new(Some(finish)));
        let priv_area = PrivArea::alloc(priv_size).map(Arc::new);

        for shard in 0..shard_count {
            let queue = if self.queues.queue_count() == 0 {
                self.queues.management_queue()
            } else {
                self.queues.queue(shard as usize)
            };
            let shard_fn = Arc::clone(&shard_fn);
            let remaining = Arc::clone(&remaining);
            let first_error = Arc::clone(&first_error);
            let finish = Arc::clone(&finish);
            let priv_area = priv_area.clone();
            queue.push_closure(
                Box::new(move || {
                    let status = shard_fn(shard, shard_count, priv_area.as_deref());
                    if status != 0 {
                        // Latch only the first error; later ones are
                        // logged but do not overwrite it.
                        if first_error
                            .compare_exchange(0, status, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                        {
                            log::debug!(
                                "parallelizer: shard {shard} failed with {status}, \
                                 but an earlier shard already latched an error"
                            );
                        }
                    }
                    complete_one(&remaining, &first_error, &finish);
                }),
                PushFlags::ALLOW_SYNC,
            );
        }

        complete_one(&remaining, &first_error, &finish);
    }
}

fn complete_one(
    remaining: &Arc<AtomicU32>,
    first_error: &Arc<AtomicI32>,
    finish: &Arc<Mutex<Option<FinishFn>>>,
) {
    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        if let Some(finish) = finish.lock().unwrap().take() {
            finish(first_error.load(Ordering::Acquire));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn all_shards_succeed_reports_zero() {
        let fabric = Arc::new(QueueFabric::new(4));
        let parallelizer = Parallelizer::new(fabric);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let (tx, rx) = channel();
        parallelizer.run(
            8,
            0,
            Arc::new(move |_shard, total, priv_area| {
                assert_eq!(total, 8);
                assert!(priv_area.is_none());
                ran_clone.fetch_add(1, Ordering::AcqRel);
                0
            }),
            Box::new(move |status| tx.send(status).unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
        assert_eq!(ran.load(Ordering::Acquire), 8);
    }

    #[test]
    fn first_error_wins_and_finish_fires_once() {
        let fabric = Arc::new(QueueFabric::new(2));
        let parallelizer = Parallelizer::new(fabric);
        let (tx, rx) = channel();
        parallelizer.run(
            4,
            0,
            Arc::new(|shard, _total, _priv_area| if shard >= 2 { -7 } else { 0 }),
            Box::new(move |status| tx.send(status).unwrap()),
        );
        let status = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, -7);
    }

    #[test]
    fn zero_shards_completes_immediately() {
        let fabric = Arc::new(QueueFabric::new(1));
        let parallelizer = Parallelizer::new(fabric);
        let (tx, rx) = channel();
        parallelizer.run(
            0,
            0,
            Arc::new(|_, _, _| 0),
            Box::new(move |status| tx.send(status).unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
    }

    #[test]
    fn shards_bind_to_management_queue_when_no_io_queues_configured() {
        let fabric = Arc::new(QueueFabric::new(0));
        let parallelizer = Parallelizer::new(fabric);
        let (tx, rx) = channel();
        parallelizer.run(
            3,
            0,
            Arc::new(|_, _, _| 0),
            Box::new(move |status| tx.send(status).unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
    }

    #[test]
    fn every_shard_shares_the_same_aligned_priv_area() {
        let fabric = Arc::new(QueueFabric::new(4));
        let parallelizer = Parallelizer::new(fabric);
        let seen_ptrs: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen_ptrs);
        let (tx, rx) = channel();
        parallelizer.run(
            4,
            256,
            Arc::new(move |_shard, total, priv_area| {
                assert_eq!(total, 4);
                let area = priv_area.expect("priv_size was non-zero");
                assert_eq!(area.len(), 256);
                assert_eq!(area.as_ptr() as usize % 64, 0);
                seen_clone.lock().unwrap().push(area.as_ptr() as usize);
                0
            }),
            Box::new(move |status| tx.send(status).unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
        let seen = seen_ptrs.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|&p| p == seen[0]));
    }

    #[test]
    fn zero_priv_size_hands_back_no_priv_area() {
        let fabric = Arc::new(QueueFabric::new(1));
        let parallelizer = Parallelizer::new(fabric);
        let (tx, rx) = channel();
        parallelizer.run(
            2,
            0,
            Arc::new(|_, _, priv_area| {
                assert!(priv_area.is_none());
                0
            }),
            Box::new(move |status| tx.send(status).unwrap()),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);
    }
}
