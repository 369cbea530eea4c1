//! Byte Allocator backed directly by the platform heap.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use log::trace;

use crate::align::Alignment;
use crate::allocator::ByteAllocator;
use crate::error::{MemResult, MemoryError};

fn layout_for(size: u64, align: Alignment) -> MemResult<Layout> {
    let size = usize::try_from(size).map_err(|_| MemoryError::SizeOverflow)?;
    Layout::from_size_align(size, align.as_usize()).map_err(|_| MemoryError::SizeOverflow)
}

/// Plain heap-backed allocator. No page accounting; `num_allocated` and
/// friends report zero, matching the default trait behavior.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl HeapAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl ByteAllocator for HeapAllocator {
    unsafe fn allocate(&self, size: u64, align: Alignment) -> MemResult<NonNull<u8>> {
        let layout = layout_for(size, align)?;
        let ptr = alloc::alloc(layout);
        trace!("heap allocate: {size} bytes, align {:?} -> {:?}", align, ptr);
        NonNull::new(ptr).ok_or(MemoryError::AllocatorFailure)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: u64, align: Alignment) {
        trace!("heap free: {size} bytes at {:?}", ptr);
        if let Ok(layout) = layout_for(size, align) {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: u64,
        new_size: u64,
        align: Alignment,
    ) -> MemResult<NonNull<u8>> {
        let old_layout = layout_for(old_size, align)?;
        let new_size_usize = usize::try_from(new_size).map_err(|_| MemoryError::SizeOverflow)?;
        let raw = alloc::realloc(ptr.as_ptr(), old_layout, new_size_usize);
        trace!("heap reallocate: {old_size} -> {new_size} bytes at {:?}", ptr);
        NonNull::new(raw).ok_or(MemoryError::AllocatorFailure)
    }
}
