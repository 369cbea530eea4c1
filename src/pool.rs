//! The memory pool tree: the accounting node every allocation flows
//! through.

use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use log::{debug, trace, warn};
use portable_atomic::{AtomicBool, AtomicI64, Ordering};
use spin::Mutex;

use crate::align::Alignment;
use crate::allocator::ByteAllocator;
use crate::error::{MemResult, MemoryError};
use crate::tracker::UsageTracker;

/// Quota and running total shared by the whole tree rooted at one
/// `MemoryManager`. Kept separate from `Pool` so pools don't need a back
/// reference to their manager.
pub(crate) struct GlobalQuota {
    pub quota: Option<u64>,
    pub current: AtomicI64,
}

impl GlobalQuota {
    pub fn new(quota: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            quota,
            current: AtomicI64::new(0),
        })
    }

    /// Attempts to reserve `delta` additional bytes globally. `delta` may be
    /// negative (a release). Returns the quota that was exceeded, if any,
    /// leaving `current` unchanged on failure.
    fn try_reserve(&self, delta: i64) -> Result<(), u64> {
        let mut observed = self.current.load(Ordering::Relaxed);
        loop {
            let candidate = observed + delta;
            if delta > 0 {
                if let Some(quota) = self.quota {
                    if candidate > quota as i64 {
                        return Err(quota);
                    }
                }
            }
            match self.current.compare_exchange_weak(
                observed,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => observed = actual,
            }
        }
    }
}

/// A node in the hierarchical accounting tree.
pub struct Pool {
    name: String,
    cap: Option<u64>,
    current: AtomicI64,
    peak: AtomicI64,
    capped: AtomicBool,
    alignment: Alignment,
    parent: Option<Arc<Pool>>,
    children: Mutex<Vec<Weak<Pool>>>,
    allocator: Arc<dyn ByteAllocator>,
    tracker: Mutex<Option<Arc<dyn UsageTracker>>>,
    pub(crate) global: Arc<GlobalQuota>,
}

impl Pool {
    pub(crate) fn new_root(
        name: impl Into<String>,
        cap: Option<u64>,
        alignment: Alignment,
        allocator: Arc<dyn ByteAllocator>,
        global: Arc<GlobalQuota>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            cap,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            capped: AtomicBool::new(false),
            alignment,
            parent: None,
            children: Mutex::new(Vec::new()),
            allocator,
            tracker: Mutex::new(None),
            global,
        })
    }

    /// Creates a child pool of `self`. If `self` is currently capped, the
    /// child is born capped too.
    pub fn add_child(self: &Arc<Self>, name: impl Into<String>, cap: Option<u64>) -> Arc<Pool> {
        let child = Arc::new(Pool {
            name: name.into(),
            cap,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            capped: AtomicBool::new(self.capped.load(Ordering::Acquire)),
            alignment: self.alignment,
            parent: Some(self.clone()),
            children: Mutex::new(Vec::new()),
            allocator: self.allocator.clone(),
            tracker: Mutex::new(None),
            global: self.global.clone(),
        });
        self.children.lock().push(Arc::downgrade(&child));
        trace!("pool '{}' added child '{}'", self.name, child.name);
        child
    }

    /// Invokes `f` once for every currently-live child. Dead weak entries
    /// encountered along the way are dropped.
    pub fn visit_children(&self, mut f: impl FnMut(&Arc<Pool>)) {
        let mut children = self.children.lock();
        children.retain(|weak| {
            if let Some(strong) = weak.upgrade() {
                f(&strong);
                true
            } else {
                false
            }
        });
    }

    pub fn child_count(&self) -> usize {
        let mut children = self.children.lock();
        children.retain(|w| w.strong_count() > 0);
        children.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Pool>> {
        self.parent.as_ref()
    }

    pub fn alignment(&self) -> Alignment {
        self.alignment
    }

    pub fn current_bytes(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn max_bytes(&self) -> i64 {
        self.peak.load(Ordering::Acquire)
    }

    pub fn is_memory_capped(&self) -> bool {
        self.capped.load(Ordering::Acquire)
    }

    /// Sets the capped flag on this pool and every descendant, regardless
    /// of their current state.
    pub fn cap_memory_allocation(&self) {
        self.capped.store(true, Ordering::Release);
        let mut changed = 1usize;
        self.visit_children(|child| changed += child.cap_recursive());
        debug!("pool '{}' capped ({} descendants affected)", self.name, changed - 1);
    }

    fn cap_recursive(&self) -> usize {
        self.capped.store(true, Ordering::Release);
        let mut changed = 1usize;
        self.visit_children(|child| changed += child.cap_recursive());
        changed
    }

    /// Clears the capped flag on this pool and its descendants, unless an
    /// ancestor is still capped — in which case the call is a no-op.
    pub fn uncap_memory_allocation(&self) {
        if let Some(parent) = &self.parent {
            if parent.is_memory_capped() {
                trace!("pool '{}' uncap is a no-op: parent still capped", self.name);
                return;
            }
        }
        let mut changed = 1usize;
        self.capped.store(false, Ordering::Release);
        self.visit_children(|child| changed += child.uncap_recursive());
        debug!("pool '{}' uncapped ({} descendants affected)", self.name, changed - 1);
    }

    fn uncap_recursive(&self) -> usize {
        self.capped.store(false, Ordering::Release);
        let mut changed = 1usize;
        self.visit_children(|child| changed += child.uncap_recursive());
        changed
    }

    pub fn set_memory_usage_tracker(&self, new_tracker: Option<Arc<dyn UsageTracker>>) {
        let mut slot = self.tracker.lock();
        let current = self.current.load(Ordering::Acquire).max(0) as u64;

        if let Some(old) = slot.as_ref() {
            if current > 0 {
                old.record_free(current);
            }
        }
        if let Some(new) = &new_tracker {
            if current > 0 {
                new.record_alloc(current);
            }
        }
        debug!(
            "pool '{}' swapped usage tracker, carrying {} outstanding bytes",
            self.name, current
        );
        *slot = new_tracker;
    }

    fn local_cap_check(&self, requested_current: i64, rounded: u64) -> MemResult<()> {
        if let Some(cap) = self.cap {
            if requested_current > cap as i64 {
                return Err(MemoryError::local_cap(
                    &self.name,
                    cap,
                    rounded,
                ));
            }
        }
        Ok(())
    }

    /// Atomically reserves `delta` additional accounted bytes against the
    /// tree's global quota and this pool's local cap. Rolls back on
    /// failure so no partial state survives a rejected request.
    ///
    /// The global quota is checked first: Scenario B (local-only failure,
    /// request fits under the global quota) and Scenario C (request blown
    /// by the global quota alone) are only both satisfiable if a request
    /// that would exceed the global quota reports the global-cap error even
    /// when it would *also* have exceeded the local cap.
    fn reserve_capacity(&self, delta: i64, rounded_abs: u64) -> MemResult<()> {
        if delta > 0 {
            if let Err(quota) = self.global.try_reserve(delta) {
                return Err(MemoryError::global_cap(quota));
            }
        } else {
            let _ = self.global.try_reserve(delta);
        }

        let mut observed = self.current.load(Ordering::Relaxed);
        loop {
            let candidate = observed + delta;
            if delta > 0 {
                if let Err(e) = self.local_cap_check(candidate, rounded_abs) {
                    // Roll back the global reservation we just made.
                    self.global.try_reserve(-delta).ok();
                    return Err(e);
                }
            }
            match self.current.compare_exchange_weak(
                observed,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => observed = actual,
            }
        }

        bump_running_peak(&self.peak, self.current.load(Ordering::Relaxed));
        Ok(())
    }

    /// Allocates `bytes`, rounded to this pool's alignment, and attributes
    /// them to this pool.
    pub fn allocate(self: &Arc<Self>, bytes: u64) -> MemResult<NonNull<u8>> {
        if self.is_memory_capped() {
            warn!("pool '{}' rejected allocate: manually capped", self.name);
            return Err(MemoryError::ManuallyCapped);
        }

        let rounded = self.alignment.round_up(bytes)?;
        self.reserve_capacity(rounded as i64, rounded).map_err(|e| {
            warn!("pool '{}' rejected allocate of {rounded} bytes: {e}", self.name);
            e
        })?;

        match unsafe { self.allocator.allocate(rounded, self.alignment) } {
            Ok(ptr) => {
                if let Some(tracker) = self.tracker.lock().as_ref() {
                    tracker.record_alloc(rounded);
                }
                trace!(
                    "pool '{}' allocate {rounded} bytes -> current {}",
                    self.name,
                    self.current_bytes()
                );
                Ok(ptr)
            }
            Err(e) => {
                // The reservation succeeded but the backing allocator
                // failed; give the bytes back.
                self.reserve_capacity(-(rounded as i64), rounded).ok();
                Err(e)
            }
        }
    }

    /// Returns `bytes` (the size the matching `allocate`/`reallocate`
    /// accounted, after rounding) to the pool.
    pub fn free(&self, ptr: NonNull<u8>, bytes: u64) {
        let rounded = match self.alignment.round_up(bytes) {
            Ok(r) => r,
            Err(_) => bytes,
        };
        unsafe { self.allocator.free(ptr, rounded, self.alignment) };
        self.reserve_capacity(-(rounded as i64), rounded).ok();
        if let Some(tracker) = self.tracker.lock().as_ref() {
            tracker.record_free(rounded);
        }
        trace!(
            "pool '{}' free {rounded} bytes -> current {}",
            self.name,
            self.current_bytes()
        );
    }

    /// Grows or shrinks a live allocation. On cap failure the original
    /// allocation and all counters are left exactly as they were.
    pub fn reallocate(
        self: &Arc<Self>,
        ptr: NonNull<u8>,
        old_bytes: u64,
        new_bytes: u64,
    ) -> MemResult<NonNull<u8>> {
        if self.is_memory_capped() {
            return Err(MemoryError::ManuallyCapped);
        }

        let rounded_old = self.alignment.round_up(old_bytes)?;
        let rounded_new = self.alignment.round_up(new_bytes)?;
        let delta = rounded_new as i64 - rounded_old as i64;

        if delta > 0 {
            self.reserve_capacity(delta, rounded_new)?;
        }

        match unsafe {
            self.allocator
                .reallocate(ptr, rounded_old, rounded_new, self.alignment)
        } {
            Ok(new_ptr) => {
                if delta < 0 {
                    self.reserve_capacity(delta, rounded_old).ok();
                }
                if let Some(tracker) = self.tracker.lock().as_ref() {
                    tracker.record_realloc(rounded_old, rounded_new);
                }
                trace!(
                    "pool '{}' reallocate {rounded_old} -> {rounded_new} bytes",
                    self.name
                );
                Ok(new_ptr)
            }
            Err(e) => {
                if delta > 0 {
                    self.reserve_capacity(-delta, rounded_new).ok();
                }
                Err(e)
            }
        }
    }

    /// Accounts `bytes` as outstanding without calling the allocator, for
    /// memory the caller manages itself.
    pub fn reserve(&self, bytes: u64) -> MemResult<()> {
        let rounded = self.alignment.round_up(bytes)?;
        self.reserve_capacity(rounded as i64, rounded)?;
        if let Some(tracker) = self.tracker.lock().as_ref() {
            tracker.record_alloc(rounded);
        }
        Ok(())
    }

    /// Releases bytes previously accounted with `reserve`.
    pub fn release(&self, bytes: u64) {
        let rounded = self.alignment.round_up(bytes).unwrap_or(bytes);
        self.reserve_capacity(-(rounded as i64), rounded).ok();
        if let Some(tracker) = self.tracker.lock().as_ref() {
            tracker.record_free(rounded);
        }
    }

    pub fn get_preferred_size(&self, size: u64) -> u64 {
        crate::align::preferred_size(size)
    }
}

fn bump_running_peak(peak: &AtomicI64, candidate: i64) {
    let mut observed = peak.load(Ordering::Relaxed);
    while candidate > observed {
        match peak.compare_exchange_weak(observed, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => observed = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::heap::HeapAllocator;

    fn root(quota: Option<u64>) -> Arc<Pool> {
        let global = GlobalQuota::new(quota);
        Pool::new_root("root", None, Alignment::None, Arc::new(HeapAllocator::new()), global)
    }

    #[test]
    fn basic_allocate_free_scenario_a() {
        let root = root(Some(8 * 1024 * 1024 * 1024));
        let q = root.add_child("q", None);

        let p1 = q.allocate(32 * 1024 * 1024).unwrap();
        assert_eq!(q.current_bytes(), 32 * 1024 * 1024);
        assert_eq!(q.max_bytes(), 32 * 1024 * 1024);

        let p2 = q.allocate(96 * 1024 * 1024).unwrap();
        assert_eq!(q.current_bytes(), 128 * 1024 * 1024);
        assert_eq!(q.max_bytes(), 128 * 1024 * 1024);

        q.free(p2, 96 * 1024 * 1024);
        assert_eq!(q.current_bytes(), 32 * 1024 * 1024);
        assert_eq!(q.max_bytes(), 128 * 1024 * 1024);

        q.free(p1, 32 * 1024 * 1024);
        assert_eq!(q.current_bytes(), 0);
        assert_eq!(q.max_bytes(), 128 * 1024 * 1024);
    }

    #[test]
    fn local_cap_scenario_b() {
        let root = root(Some(127 * 1024 * 1024));
        let q = root.add_child("q", Some(63 * 1024 * 1024));

        let err = q.allocate(64 * 1024 * 1024).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Exceeded memory cap of 63.00MB when requesting 64.00MB"
        );
        assert_eq!(q.current_bytes(), 0);
        assert!(!q.is_memory_capped());
    }

    #[test]
    fn global_cap_scenario_c() {
        let root = root(Some(127 * 1024 * 1024));
        let q = root.add_child("q", Some(63 * 1024 * 1024));

        let err = q.allocate(128 * 1024 * 1024).unwrap_err();
        assert_eq!(err.to_string(), "Exceeded memory manager cap of 127 MB");
        assert_eq!(q.current_bytes(), 0);
    }

    #[test]
    fn subtree_cap_propagation_scenario_d() {
        let root = root(None);
        let a = root.add_child("A", None);
        let aa = a.add_child("AA", None);
        let ab = a.add_child("AB", None);
        let aba = ab.add_child("ABA", None);
        let b = root.add_child("B", None);
        let ba = b.add_child("BA", None);
        let bb = b.add_child("BB", None);
        let bc = b.add_child("BC", None);

        a.cap_memory_allocation();
        assert!(a.is_memory_capped());
        assert!(aa.is_memory_capped());
        assert!(ab.is_memory_capped());
        assert!(aba.is_memory_capped());
        assert!(!root.is_memory_capped());
        assert!(!b.is_memory_capped());
        assert!(!ba.is_memory_capped());

        root.cap_memory_allocation();
        assert!(bb.is_memory_capped());

        // Clear the whole tree so the next re-cap of B is independent of
        // root's prior state; otherwise A's uncap below would be gated by
        // root still being capped (invariant 5).
        root.uncap_memory_allocation();
        b.cap_memory_allocation();
        a.uncap_memory_allocation();
        assert!(!a.is_memory_capped());
        assert!(!aa.is_memory_capped());
        assert!(b.is_memory_capped());

        bb.uncap_memory_allocation();
        assert!(bb.is_memory_capped(), "parent B still capped, uncap is a no-op");
    }

    #[test]
    fn child_inherits_capped_state_at_creation() {
        let root = root(None);
        root.cap_memory_allocation();
        let child = root.add_child("child", None);
        assert!(child.is_memory_capped());
    }

    #[test]
    fn reallocate_failure_preserves_state() {
        let root = root(Some(1024));
        let q = root.add_child("q", None);
        let p = q.allocate(512).unwrap();
        assert_eq!(q.current_bytes(), 512);

        let err = q.reallocate(p, 512, 2048).unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(q.current_bytes(), 512, "failed reallocate must not mutate accounting");

        q.free(p, 512);
    }

    #[test]
    fn tracker_swap_carries_outstanding_bytes_scenario_f() {
        let root = root(None);
        let q = root.add_child("q", None);
        let t1 = crate::tracker::DefaultUsageTracker::new();
        q.set_memory_usage_tracker(Some(t1.clone()));

        let p = q.allocate(4096).unwrap();
        assert_eq!(t1.current_user_bytes(), 4096);

        let t2 = crate::tracker::DefaultUsageTracker::new();
        q.set_memory_usage_tracker(Some(t2.clone()));
        assert_eq!(t1.current_user_bytes(), 0);
        assert_eq!(t2.current_user_bytes(), 4096);

        q.free(p, 4096);
        assert_eq!(t2.current_user_bytes(), 0);
        assert!(t2.peak_total_bytes() >= 4096);
    }

    #[test]
    fn child_count_reflects_live_children() {
        let root = root(None);
        assert_eq!(root.child_count(), 0);
        let a = root.add_child("a", None);
        assert_eq!(root.child_count(), 1);
        drop(a);
        assert_eq!(root.child_count(), 0);
    }
}
