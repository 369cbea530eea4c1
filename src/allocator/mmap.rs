//! Page-class `mmap` allocator.
//!
//! Requests are rounded up to a 4 KiB page count. Requests that fit in the
//! largest configured size class go through the size-class path: every
//! allocation maps fresh pages (no page reuse — trimming unused size-class
//! pages is a policy decision deferred past this allocator, see module
//! notes on `num_mapped`). Requests bigger than the largest class go
//! through the external path, which maps and unmaps exactly what was asked
//! for.

use std::ptr::NonNull;

use log::trace;
use portable_atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::align::Alignment;
use crate::allocator::ByteAllocator;
use crate::error::{MemResult, MemoryError};

pub const PAGE_SIZE: u64 = 4096;

/// Default size classes, in pages, matching the design notes' example.
pub const DEFAULT_SIZE_CLASSES: &[u32] = &[1, 2, 4, 8, 16, 32, 64, 128, 256];

fn pages_for(bytes: u64) -> u64 {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// A page-class mmap allocator bounded by `capacity` bytes.
pub struct MmapAllocator {
    capacity_pages: u64,
    size_classes: Vec<u64>,
    num_allocated: AtomicU64,
    num_mapped: AtomicU64,
    num_external_mapped: AtomicU64,
    // Tracked purely so Drop can release every mapping this allocator ever
    // made; size-class pages are never unmapped on `free`.
    live_mappings: Mutex<Vec<(*mut u8, usize)>>,
}

unsafe impl Send for MmapAllocator {}
unsafe impl Sync for MmapAllocator {}

impl MmapAllocator {
    pub fn new(capacity_bytes: u64, size_classes: &[u32]) -> Self {
        let mut classes: Vec<u64> = size_classes.iter().map(|&p| p as u64).collect();
        classes.sort_unstable();
        Self {
            capacity_pages: pages_for(capacity_bytes),
            size_classes: classes,
            num_allocated: AtomicU64::new(0),
            num_mapped: AtomicU64::new(0),
            num_external_mapped: AtomicU64::new(0),
            live_mappings: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default_classes(capacity_bytes: u64) -> Self {
        Self::new(capacity_bytes, DEFAULT_SIZE_CLASSES)
    }

    fn largest_class(&self) -> u64 {
        *self.size_classes.last().unwrap_or(&0)
    }

    fn class_for(&self, pages: u64) -> Option<u64> {
        self.size_classes.iter().copied().find(|&c| c >= pages)
    }

    #[cfg(unix)]
    fn map_pages(&self, pages: u64) -> MemResult<NonNull<u8>> {
        let len = (pages * PAGE_SIZE) as usize;
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(MemoryError::AllocatorFailure);
            }
            self.live_mappings.lock().push((ptr as *mut u8, len));
            Ok(NonNull::new_unchecked(ptr as *mut u8))
        }
    }

    #[cfg(unix)]
    fn unmap_pages(&self, ptr: NonNull<u8>, pages: u64) {
        let len = (pages * PAGE_SIZE) as usize;
        unsafe {
            libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
        }
        let mut mappings = self.live_mappings.lock();
        if let Some(idx) = mappings.iter().position(|(p, _)| *p == ptr.as_ptr()) {
            mappings.swap_remove(idx);
        }
    }

    #[cfg(not(unix))]
    fn map_pages(&self, pages: u64) -> MemResult<NonNull<u8>> {
        let len = (pages * PAGE_SIZE) as usize;
        let layout = std::alloc::Layout::from_size_align(len, PAGE_SIZE as usize)
            .map_err(|_| MemoryError::SizeOverflow)?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocatorFailure)
    }

    #[cfg(not(unix))]
    fn unmap_pages(&self, ptr: NonNull<u8>, pages: u64) {
        let len = (pages * PAGE_SIZE) as usize;
        if let Ok(layout) = std::alloc::Layout::from_size_align(len, PAGE_SIZE as usize) {
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

impl Drop for MmapAllocator {
    fn drop(&mut self) {
        let mappings = std::mem::take(&mut *self.live_mappings.lock());
        for (ptr, len) in mappings {
            unsafe {
                #[cfg(unix)]
                libc::munmap(ptr as *mut libc::c_void, len);
                #[cfg(not(unix))]
                {
                    let _ = ptr;
                    let _ = len;
                }
            }
        }
    }
}

impl ByteAllocator for MmapAllocator {
    unsafe fn allocate(&self, size: u64, _align: Alignment) -> MemResult<NonNull<u8>> {
        let pages = pages_for(size).max(1);
        if self.num_allocated.load(Ordering::Relaxed) + pages > self.capacity_pages
            && self.capacity_pages > 0
        {
            return Err(MemoryError::AllocatorFailure);
        }

        match self.class_for(pages) {
            Some(class_pages) => {
                trace!("mmap size-class allocate: {pages} pages -> class {class_pages}");
                let ptr = self.map_pages(class_pages)?;
                self.num_allocated.fetch_add(class_pages, Ordering::Relaxed);
                self.num_mapped.fetch_add(class_pages, Ordering::Relaxed);
                Ok(ptr)
            }
            None => {
                trace!("mmap external allocate: {pages} pages (largest class {})", self.largest_class());
                let ptr = self.map_pages(pages)?;
                self.num_allocated.fetch_add(pages, Ordering::Relaxed);
                self.num_external_mapped.fetch_add(pages, Ordering::Relaxed);
                Ok(ptr)
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: u64, _align: Alignment) {
        let pages = pages_for(size).max(1);
        match self.class_for(pages) {
            Some(class_pages) => {
                // Size-class pages stay mapped; only the allocation count
                // shrinks. Matches the allocator's stated trimming policy.
                self.num_allocated.fetch_sub(class_pages, Ordering::Relaxed);
            }
            None => {
                self.unmap_pages(ptr, pages);
                self.num_allocated.fetch_sub(pages, Ordering::Relaxed);
                self.num_external_mapped.fetch_sub(pages, Ordering::Relaxed);
            }
        }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: u64,
        new_size: u64,
        align: Alignment,
    ) -> MemResult<NonNull<u8>> {
        let new_ptr = self.allocate(new_size, align)?;
        let copy_len = old_size.min(new_size) as usize;
        std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
        self.free(ptr, old_size, align);
        Ok(new_ptr)
    }

    fn num_allocated(&self) -> u64 {
        self.num_allocated.load(Ordering::Relaxed)
    }

    fn num_mapped(&self) -> u64 {
        self.num_mapped.load(Ordering::Relaxed)
    }

    fn num_external_mapped(&self) -> u64 {
        self.num_external_mapped.load(Ordering::Relaxed)
    }
}
