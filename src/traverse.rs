//! The hash/traverse service: populates a request's cache-line mapping
//! and hit/dirty/mapped-count status, and owns repartitioning and
//! cleaning. External collaborator in the real system — this module
//! defines the seam plus a reference in-process implementation for the
//! demo binary and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use crate::concurrency::line_ids;
use crate::request::{Request, TraverseInfo};

/// The traverse/metadata-layer interface.
pub trait TraverseService: Send + Sync {
    /// Populates `req.info` and the per-line map.
    fn traverse(&self, req: &Request);

    /// Whether any cache lines assigned to this request belong to the
    /// wrong user-partition bucket.
    fn needs_repart(&self, req: &Request) -> bool;

    /// Moves misassigned cache lines to the request's partition.
    fn user_part_move(&self, req: &Request);

    /// Whether every cache line mapped to this request is dirty.
    fn is_dirty_all(&self, req: &Request) -> bool;

    /// Submits a clean (write-back of dirty lines) for the request.
    /// `on_complete` is invoked exactly once with `Ok(())` on success or
    /// `Err(status)` on failure, from whatever thread the clean
    /// subsystem completes on.
    fn clean(&self, req: &Request, on_complete: Box<dyn FnOnce(Request, Result<(), i32>) + Send>);

    /// Drops the mapping for every cache line the request covers, so a
    /// pass-through write cannot leave stale cached data behind it.
    fn invalidate(&self, req: &Request);
}

#[derive(Debug, Clone, Copy, Default)]
struct LineMeta {
    mapped: bool,
    dirty: bool,
}

/// A reference traverse/metadata service backed by an in-memory line
/// table the test/demo code can seed directly. Real cache-line
/// metadata storage, eviction, and the hash-bucket protection scheme
/// are out of scope; this is a test double for the traverse/clean
/// contract, not a cache implementation.
#[derive(Default)]
pub struct InProcessTraverseService {
    lines: Mutex<HashMap<u64, LineMeta>>,
    needs_repart_lines: Mutex<HashSet<u64>>,
    force_clean_failure: AtomicBool,
}

impl InProcessTraverseService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the mapping/dirty state of a single cache line (test/demo
    /// setup helper).
    pub fn set_line(&self, line_id: u64, mapped: bool, dirty: bool) {
        self.lines
            .lock()
            .unwrap()
            .insert(line_id, LineMeta { mapped, dirty });
    }

    /// Flags a line as belonging to the wrong partition bucket.
    pub fn flag_needs_repart(&self, line_id: u64) {
        self.needs_repart_lines.lock().unwrap().insert(line_id);
    }

    /// Test hook: make the next `clean()` call report failure.
    pub fn force_next_clean_to_fail(&self) {
        self.force_clean_failure.store(true, Ordering::Release);
    }
}

impl TraverseService for InProcessTraverseService {
    fn traverse(&self, req: &Request) {
        let ids = line_ids(req);
        let lines = self.lines.lock().unwrap();
        let mut dirty_any = false;
        let mut hit_no = 0u32;
        let mut mapped_count = 0u32;
        for id in &ids {
            if let Some(meta) = lines.get(id) {
                if meta.mapped {
                    mapped_count += 1;
                    hit_no += 1;
                    if meta.dirty {
                        dirty_any = true;
                    }
                }
            }
        }
        log::trace!(
            "request {}: traverse -> dirty_any={dirty_any} hit_no={hit_no} mapped_count={mapped_count}",
            req.id()
        );
        req.set_info(TraverseInfo {
            dirty_any,
            hit_no,
            mapped_count,
        });
    }

    fn needs_repart(&self, req: &Request) -> bool {
        let ids = line_ids(req);
        let repart = self.needs_repart_lines.lock().unwrap();
        ids.iter().any(|id| repart.contains(id))
    }

    fn user_part_move(&self, req: &Request) {
        let ids = line_ids(req);
        let mut repart = self.needs_repart_lines.lock().unwrap();
        for id in &ids {
            repart.remove(id);
        }
        log::debug!("request {}: moved to partition {}", req.id(), req.part_id());
    }

    fn is_dirty_all(&self, req: &Request) -> bool {
        let ids = line_ids(req);
        let lines = self.lines.lock().unwrap();
        let mapped: Vec<_> = ids
            .iter()
            .filter_map(|id| lines.get(id).filter(|m| m.mapped))
            .collect();
        !mapped.is_empty() && mapped.iter().all(|m| m.dirty)
    }

    fn clean(
        &self,
        req: &Request,
        on_complete: Box<dyn FnOnce(Request, Result<(), i32>) + Send>,
    ) {
        let ids = line_ids(req);
        let should_fail = self.force_clean_failure.swap(false, Ordering::AcqRel);
        if !should_fail {
            let mut lines = self.lines.lock().unwrap();
            for id in &ids {
                if let Some(meta) = lines.get_mut(id) {
                    meta.dirty = false;
                }
            }
        }
        let snapshot = ids;
        let held = req.get();
        let req_for_thread = req.clone();
        thread::spawn(move || {
            if should_fail {
                log::warn!("request {}: clean failed", req_for_thread.id());
                on_complete(req_for_thread, Err(-5));
            } else {
                log::debug!(
                    "request {}: clean completed for {} lines",
                    req_for_thread.id(),
                    snapshot.len()
                );
                on_complete(req_for_thread, Ok(()));
            }
            held.put();
        });
    }

    fn invalidate(&self, req: &Request) {
        let ids = line_ids(req);
        let mut lines = self.lines.lock().unwrap();
        for id in &ids {
            lines.remove(id);
        }
        log::trace!("request {}: invalidated {} lines", req.id(), ids.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Direction;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::time::Duration;

    fn req(addr: u64, lines: u32) -> Request {
        Request::new(
            addr,
            lines * 4096,
            lines,
            Direction::Read,
            0,
            Arc::new(AtomicU32::new(0)),
            Box::new(|_, _| {}),
        )
    }

    #[test]
    fn traverse_reports_dirty_and_mapped() {
        let svc = InProcessTraverseService::new();
        svc.set_line(0, true, true);
        let r = req(0, 1);
        svc.traverse(&r);
        let info = r.info();
        assert!(info.dirty_any);
        assert_eq!(info.mapped_count, 1);
        assert_eq!(info.hit_no, 1);
    }

    #[test]
    fn traverse_reports_no_mapping_for_unknown_lines() {
        let svc = InProcessTraverseService::new();
        let r = req(0, 1);
        svc.traverse(&r);
        let info = r.info();
        assert_eq!(info.mapped_count, 0);
        assert!(!info.dirty_any);
    }

    #[test]
    fn clean_invokes_completion_asynchronously() {
        let svc = InProcessTraverseService::new();
        svc.set_line(0, true, true);
        let r = req(0, 1);
        let (tx, rx) = channel();
        svc.clean(
            &r,
            Box::new(move |_req, result| {
                tx.send(result).unwrap();
            }),
        );
        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn invalidate_clears_mapping() {
        let svc = InProcessTraverseService::new();
        svc.set_line(0, true, true);
        let r = req(0, 1);
        svc.invalidate(&r);
        svc.traverse(&r);
        assert_eq!(r.info().mapped_count, 0);
    }

    #[test]
    fn forced_clean_failure_propagates_error() {
        let svc = InProcessTraverseService::new();
        svc.set_line(0, true, true);
        svc.force_next_clean_to_fail();
        let r = req(0, 1);
        let (tx, rx) = channel();
        svc.clean(
            &r,
            Box::new(move |_req, result| {
                tx.send(result).unwrap();
            }),
        );
        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(result.is_err());
    }
}
