//! Cache-wide runtime context: wraps the read-only [`CacheConfig`]
//! together with the two metadata-layer collaborators the resolver
//! consults (sequential-cutoff detection and the dirty-mark/
//! freeze-escalate primitive) and the fallback-pt error counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::core_device::CoreDevice;
use crate::mode::CacheMode;
use crate::request::Request;

/// Detects long sequential I/O streams that should bypass the cache to
/// avoid pollution. Deciding *when* a stream counts as sequential is an
/// external metadata-layer concern; this trait is the seam.
pub trait SeqCutoffDetector: Send + Sync {
    fn check(&self, core: &CoreDevice, req: &Request) -> bool;
}

/// Never fires. Used as the default when no stream-detection policy is
/// configured.
#[derive(Debug, Default)]
pub struct NeverSeqCutoff;

impl SeqCutoffDetector for NeverSeqCutoff {
    fn check(&self, _core: &CoreDevice, _req: &Request) -> bool {
        false
    }
}

/// A minimal reference stream detector: tracks, per core, the end
/// address of the last request and a running count of consecutive
/// requests that continued the stream. Fires once the run length
/// reaches `threshold`. This is a reasonable default, not a faithful
/// port of any specific production heuristic — admission/promotion
/// heuristics live in the metadata layer, out of scope here.
#[derive(Debug)]
pub struct SequentialStreamDetector {
    threshold: u32,
    state: std::sync::Mutex<HashMap<u32, (u64, u32)>>,
}

impl SequentialStreamDetector {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            state: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl SeqCutoffDetector for SequentialStreamDetector {
    fn check(&self, core: &CoreDevice, req: &Request) -> bool {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(core.id()).or_insert((0, 0));
        let (last_end, run) = *entry;
        let continues = req.addr() == last_end;
        let new_run = if continues { run + 1 } else { 1 };
        *entry = (req.addr() + u64::from(req.bytes()), new_run);
        new_run >= self.threshold
    }
}

/// The "mark-dirty-or-freeze-escalate" primitive: an atomic operation
/// on the request's cache-line set owned by the external metadata
/// layer. Returns `true` exactly when the mark failed *because the
/// dirty state was frozen* — the sole trigger for escalating to
/// write-through.
pub trait DirtyTracker: Send + Sync {
    fn mark_dirty_or_freeze_escalate(&self, req: &Request) -> bool;
}

/// Marking always succeeds, never observes a freeze. This is the
/// common case; lazy-write modes stay lazy.
#[derive(Debug, Default)]
pub struct NeverFreezeDirtyTracker;

impl DirtyTracker for NeverFreezeDirtyTracker {
    fn mark_dirty_or_freeze_escalate(&self, _req: &Request) -> bool {
        false
    }
}

/// Test/demo double that always reports a freeze, forcing escalation.
#[derive(Debug, Default)]
pub struct AlwaysFreezeDirtyTracker;

impl DirtyTracker for AlwaysFreezeDirtyTracker {
    fn mark_dirty_or_freeze_escalate(&self, _req: &Request) -> bool {
        true
    }
}

/// Cache-wide runtime context.
pub struct Cache {
    pub config: Arc<CacheConfig>,
    fallback_pt_error_counter: AtomicI32,
    seq_cutoff: Arc<dyn SeqCutoffDetector>,
    dirty_tracker: Arc<dyn DirtyTracker>,
}

impl Cache {
    /// `ocf_fallback_pt_is_on`: the threshold being the inactive
    /// sentinel (`None`) means fallback-pt can never trigger.
    #[must_use]
    pub fn fallback_pt_is_on(&self) -> bool {
        let counter = self.fallback_pt_error_counter.load(Ordering::Acquire);
        debug_assert!(counter >= 0, "fallback-pt error counter went negative");
        match self.config.fallback_pt_error_threshold {
            Some(threshold) => counter >= i32::try_from(threshold).unwrap_or(i32::MAX),
            None => false,
        }
    }

    /// Feeds a cache/core-device error into the fallback-pt counter.
    /// A core device read error contributes to this counter the same
    /// way a cache device error does.
    pub fn record_cache_device_error(&self) {
        let prev = self.fallback_pt_error_counter.fetch_add(1, Ordering::AcqRel);
        log::warn!(
            "cache device error recorded, fallback-pt error counter now {}",
            prev + 1
        );
    }

    /// Operator reset of the fallback-pt mechanism.
    pub fn reset_fallback_pt(&self) {
        self.fallback_pt_error_counter.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn fallback_pt_error_count(&self) -> i32 {
        self.fallback_pt_error_counter.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn partition_mode(&self, part_id: u32) -> Option<CacheMode> {
        self.config.partition_modes.get(&part_id).copied()
    }

    #[must_use]
    pub fn seq_cutoff_check(&self, core: &CoreDevice, req: &Request) -> bool {
        self.seq_cutoff.check(core, req)
    }

    #[must_use]
    pub fn mark_dirty_or_freeze_escalate(&self, req: &Request) -> bool {
        self.dirty_tracker.mark_dirty_or_freeze_escalate(req)
    }
}

/// Builds a [`Cache`], defaulting the two metadata-layer collaborators
/// to their no-op reference implementations.
pub struct CacheBuilder {
    config: CacheConfig,
    seq_cutoff: Arc<dyn SeqCutoffDetector>,
    dirty_tracker: Arc<dyn DirtyTracker>,
}

impl CacheBuilder {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            seq_cutoff: Arc::new(NeverSeqCutoff),
            dirty_tracker: Arc::new(NeverFreezeDirtyTracker),
        }
    }

    #[must_use]
    pub fn with_seq_cutoff(mut self, detector: Arc<dyn SeqCutoffDetector>) -> Self {
        self.seq_cutoff = detector;
        self
    }

    #[must_use]
    pub fn with_dirty_tracker(mut self, tracker: Arc<dyn DirtyTracker>) -> Self {
        self.dirty_tracker = tracker;
        self
    }

    /// Convenience used by tests that need the lazy-write escalation
    /// rule to fire deterministically.
    #[must_use]
    pub fn with_always_freeze_dirty_tracker(self) -> Self {
        self.with_dirty_tracker(Arc::new(AlwaysFreezeDirtyTracker))
    }

    #[must_use]
    pub fn build(self) -> Cache {
        Cache {
            config: Arc::new(self.config),
            fallback_pt_error_counter: AtomicI32::new(0),
            seq_cutoff: self.seq_cutoff,
            dirty_tracker: self.dirty_tracker,
        }
    }
}
