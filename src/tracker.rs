//! Usage trackers aggregate byte deltas along a logical hierarchy that is
//! independent of the pool tree: several sibling pools can feed one tracker
//! to get an aggregate view at a query or workload scope.

use std::fmt;
use std::sync::Arc;

use portable_atomic::{AtomicI64, Ordering};

/// Shared behavior both tracker variants expose to a pool.
pub trait UsageTracker: Send + Sync + fmt::Debug {
    /// A pool records a fresh allocation.
    fn record_alloc(&self, bytes: u64);
    /// A pool returns bytes it previously had accounted.
    fn record_free(&self, bytes: u64);
    /// A pool's outstanding size changed from `old_bytes` to `new_bytes`.
    fn record_realloc(&self, old_bytes: u64, new_bytes: u64);

    fn current_user_bytes(&self) -> i64;
    fn peak_total_bytes(&self) -> i64;
}

fn bump_peak(peak: &AtomicI64, candidate: i64) {
    let mut observed = peak.load(Ordering::Relaxed);
    while candidate > observed {
        match peak.compare_exchange_weak(
            observed,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => observed = actual,
        }
    }
}

/// Full +/- accounting: every delta, including reallocate-shrink, is
/// reflected in `current_user_bytes` immediately.
#[derive(Debug)]
pub struct DefaultUsageTracker {
    current: AtomicI64,
    peak: AtomicI64,
    parent: Option<Arc<dyn UsageTracker>>,
}

impl DefaultUsageTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            parent: None,
        })
    }

    pub fn with_parent(parent: Arc<dyn UsageTracker>) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            parent: Some(parent),
        })
    }

    fn apply_delta(&self, delta: i64) {
        let new_current = self.current.fetch_add(delta, Ordering::Relaxed) + delta;
        bump_peak(&self.peak, new_current);
    }
}

impl UsageTracker for DefaultUsageTracker {
    fn record_alloc(&self, bytes: u64) {
        self.apply_delta(bytes as i64);
        if let Some(parent) = &self.parent {
            parent.record_alloc(bytes);
        }
    }

    fn record_free(&self, bytes: u64) {
        self.apply_delta(-(bytes as i64));
        if let Some(parent) = &self.parent {
            parent.record_free(bytes);
        }
    }

    fn record_realloc(&self, old_bytes: u64, new_bytes: u64) {
        self.apply_delta(new_bytes as i64 - old_bytes as i64);
        if let Some(parent) = &self.parent {
            parent.record_realloc(old_bytes, new_bytes);
        }
    }

    fn current_user_bytes(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    fn peak_total_bytes(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Additive-only accounting: growth is tracked, but a shrinking
/// `reallocate` is not reflected back down. An explicit `free` (and the
/// byte transfer a pool performs when swapping trackers) is always honored,
/// since that is not a "shrink" in the reallocate sense — it is the pool
/// relinquishing the bytes outright.
#[derive(Debug)]
pub struct SimpleUsageTracker {
    current: AtomicI64,
    peak: AtomicI64,
    parent: Option<Arc<dyn UsageTracker>>,
}

impl SimpleUsageTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            parent: None,
        })
    }

    pub fn with_parent(parent: Arc<dyn UsageTracker>) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            parent: Some(parent),
        })
    }

    fn apply_delta(&self, delta: i64) {
        let new_current = self.current.fetch_add(delta, Ordering::Relaxed) + delta;
        bump_peak(&self.peak, new_current);
    }
}

impl UsageTracker for SimpleUsageTracker {
    fn record_alloc(&self, bytes: u64) {
        self.apply_delta(bytes as i64);
        if let Some(parent) = &self.parent {
            parent.record_alloc(bytes);
        }
    }

    fn record_free(&self, bytes: u64) {
        self.apply_delta(-(bytes as i64));
        if let Some(parent) = &self.parent {
            parent.record_free(bytes);
        }
    }

    fn record_realloc(&self, old_bytes: u64, new_bytes: u64) {
        if new_bytes > old_bytes {
            self.apply_delta((new_bytes - old_bytes) as i64);
            if let Some(parent) = &self.parent {
                parent.record_realloc(old_bytes, new_bytes);
            }
        }
        // Shrinking reallocations are ignored by design.
    }

    fn current_user_bytes(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    fn peak_total_bytes(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tracker_reflects_shrink() {
        let t = DefaultUsageTracker::new();
        t.record_alloc(100);
        t.record_realloc(100, 40);
        assert_eq!(t.current_user_bytes(), 40);
        assert_eq!(t.peak_total_bytes(), 100);
    }

    #[test]
    fn simple_tracker_ignores_shrink_but_honors_free() {
        let t = SimpleUsageTracker::new();
        t.record_alloc(100);
        t.record_realloc(100, 40);
        assert_eq!(t.current_user_bytes(), 100, "shrink via realloc must be ignored");
        t.record_free(100);
        assert_eq!(t.current_user_bytes(), 0, "explicit free must still be honored");
    }

    #[test]
    fn aggregates_into_parent() {
        let parent = DefaultUsageTracker::new();
        let child = DefaultUsageTracker::with_parent(parent.clone());
        child.record_alloc(50);
        assert_eq!(parent.current_user_bytes(), 50);
        child.record_free(20);
        assert_eq!(parent.current_user_bytes(), 30);
    }

    #[test]
    fn peak_never_decreases() {
        let t = DefaultUsageTracker::new();
        t.record_alloc(1000);
        t.record_free(900);
        assert_eq!(t.current_user_bytes(), 100);
        assert_eq!(t.peak_total_bytes(), 1000);
    }
}
