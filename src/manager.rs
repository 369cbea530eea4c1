//! Root holder: owns the global quota, the shared Byte Allocator, and the
//! root pool every other pool in the tree descends from.

use std::sync::Arc;

use log::debug;

use crate::align::Alignment;
use crate::allocator::heap::HeapAllocator;
use crate::allocator::ByteAllocator;
use crate::pool::{GlobalQuota, Pool};

/// Entry point for constructing a pool tree. One `MemoryManager` per
/// query engine instance; every pool created under it shares its Byte
/// Allocator and its global quota.
pub struct MemoryManager {
    global: Arc<GlobalQuota>,
    allocator: Arc<dyn ByteAllocator>,
    root: Arc<Pool>,
}

impl MemoryManager {
    /// `global_quota` of `None` means practically unbounded; pools still
    /// enforce their own local caps.
    pub fn new(global_quota: Option<u64>) -> Self {
        Self::with_allocator(global_quota, Arc::new(HeapAllocator::new()))
    }

    pub fn with_allocator(global_quota: Option<u64>, allocator: Arc<dyn ByteAllocator>) -> Self {
        let global = GlobalQuota::new(global_quota);
        let root = Pool::new_root("root", global_quota, Alignment::None, allocator.clone(), global.clone());
        debug!("memory manager constructed, global quota {:?}", global_quota);
        Self {
            global,
            allocator,
            root,
        }
    }

    pub fn root(&self) -> &Arc<Pool> {
        &self.root
    }

    pub fn allocator(&self) -> &Arc<dyn ByteAllocator> {
        &self.allocator
    }

    pub fn global_quota(&self) -> Option<u64> {
        self.global.quota
    }

    pub fn global_current_bytes(&self) -> i64 {
        self.global.current.load(portable_atomic::Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_pool_has_no_parent() {
        let mgr = MemoryManager::new(Some(1024 * 1024));
        assert!(mgr.root().parent().is_none());
        assert_eq!(mgr.global_quota(), Some(1024 * 1024));
    }

    #[test]
    fn children_share_manager_allocator_and_quota() {
        let mgr = MemoryManager::new(Some(4096));
        let a = mgr.root().add_child("a", None);
        let p = a.allocate(1024).unwrap();
        assert_eq!(mgr.global_current_bytes(), 1024);
        a.free(p, 1024);
        assert_eq!(mgr.global_current_bytes(), 0);
    }
}
