//! The Byte Allocator capability: the raw byte source every pool forwards
//! accounted allocations to. Two variants ship here: a thin heap wrapper and
//! a page-class mmap allocator.

pub mod heap;
pub mod mmap;

use std::ptr::NonNull;

use crate::align::Alignment;
use crate::error::MemResult;

/// A thread-safe raw byte source. Pools never talk to the platform heap or
/// to `mmap` directly; they always go through this trait so the accounting
/// layer stays oblivious to where bytes actually come from.
pub trait ByteAllocator: Send + Sync {
    /// # Safety
    /// `size` must be nonzero. The returned pointer is valid for `size`
    /// bytes until passed back to `free` or `reallocate`.
    unsafe fn allocate(&self, size: u64, align: Alignment) -> MemResult<NonNull<u8>>;

    /// # Safety
    /// `ptr` must have been returned by `allocate`/`reallocate` on `self`
    /// with the same `size` it was allocated or last reallocated to.
    unsafe fn free(&self, ptr: NonNull<u8>, size: u64, align: Alignment);

    /// # Safety
    /// Same preconditions as `allocate` and `free` combined: `ptr`/`old_size`
    /// describe a live allocation from this allocator.
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: u64,
        new_size: u64,
        align: Alignment,
    ) -> MemResult<NonNull<u8>>;

    /// Pages currently issued to callers (size-class + external). Zero for
    /// allocators that don't do page-level bookkeeping.
    fn num_allocated(&self) -> u64 {
        0
    }

    /// Pages currently mapped through the size-class path.
    fn num_mapped(&self) -> u64 {
        0
    }

    /// Pages currently mapped through the external (oversized) path.
    fn num_external_mapped(&self) -> u64 {
        0
    }
}
