//! Cache mode enumeration and the mode resolver.

use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::core_device::CoreDevice;
use crate::request::{Direction, Request};

/// Cache mode: a closed enumeration. The `max` sentinel is modeled as
/// the absence of a mode (`Option<CacheMode>`) rather than a variant,
/// since every place the sentinel appears is really "no mode resolved
/// yet" or "unknown for display".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMode {
    /// Write-through.
    Wt,
    /// Write-back.
    Wb,
    /// Write-around.
    Wa,
    /// Write-invalidate.
    Wi,
    /// Write-only.
    Wo,
    /// Pass-through.
    Pt,
    /// Fast (optimistic) path.
    Fast,
}

impl CacheMode {
    /// True for modes that may defer writes to the core device.
    #[must_use]
    pub fn has_lazy_write(self) -> bool {
        matches!(self, CacheMode::Wb | CacheMode::Wo)
    }

    /// Display name, matching `ocf_get_io_iface_name` (used for
    /// diagnostics only).
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CacheMode::Wt => "Write Through",
            CacheMode::Wb => "Write Back",
            CacheMode::Wa => "Write Around",
            CacheMode::Wi => "Write Invalidate",
            CacheMode::Wo => "Write Only",
            CacheMode::Pt => "Pass Through",
            CacheMode::Fast => "Fast",
        }
    }
}

/// Display name for an unresolved (`max`/`None`) mode.
#[must_use]
pub fn cache_mode_name(mode: Option<CacheMode>) -> &'static str {
    match mode {
        Some(mode) => mode.name(),
        None => "Unknown",
    }
}

/// A request is 4 KiB aligned in both start and length.
#[must_use]
fn is_4k_aligned(addr: u64, bytes: u32) -> bool {
    const ALIGN: u64 = 4096;
    addr % ALIGN == 0 && u64::from(bytes) % ALIGN == 0
}

/// Sets `req.cache_mode` to exactly one value of the closed
/// enumeration. Always succeeds; no errors are surfaced.
pub fn resolve_effective_cache_mode(cache: &Cache, core: &CoreDevice, req: &Request) {
    // Rule 1: fallback-pt.
    if cache.fallback_pt_is_on() {
        log::debug!(
            "request {}: fallback-pt active, resolving to pt",
            req.id()
        );
        req.set_cache_mode(CacheMode::Pt);
        return;
    }

    // Rule 2: unaligned I/O.
    if cache.config.pt_unaligned_io && !is_4k_aligned(req.addr(), req.bytes()) {
        log::debug!(
            "request {}: unaligned io (addr={}, bytes={}), resolving to pt",
            req.id(),
            req.addr(),
            req.bytes()
        );
        req.set_cache_mode(CacheMode::Pt);
        return;
    }

    // Rule 3: request spans more lines than the cache holds.
    if req.core_line_count() > cache.config.cachelines {
        log::debug!(
            "request {}: core_line_count {} > cachelines {}, resolving to pt",
            req.id(),
            req.core_line_count(),
            cache.config.cachelines
        );
        req.set_cache_mode(CacheMode::Pt);
        return;
    }

    // Rule 4: sequential cutoff.
    if cache.seq_cutoff_check(core, req) {
        log::debug!(
            "request {}: sequential cutoff fired, resolving to pt",
            req.id()
        );
        req.set_cache_mode(CacheMode::Pt);
        req.set_seq_cutoff(true);
        return;
    }

    // Rule 5: configured mode for the partition, falling back to the
    // cache-wide default.
    let mut resolved = cache
        .partition_mode(req.part_id())
        .unwrap_or(cache.config.default_cache_mode);

    // Rule 6: lazy-write escalation.
    if req.rw() == Direction::Write
        && resolved.has_lazy_write()
        && cache.mark_dirty_or_freeze_escalate(req)
    {
        log::debug!(
            "request {}: lazy-write escalation ({} -> wt)",
            req.id(),
            resolved.name()
        );
        resolved = CacheMode::Wt;
    }

    req.set_cache_mode(resolved);
}
