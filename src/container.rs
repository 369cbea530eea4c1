//! Small value-semantic handle adapting a [`Pool`](crate::pool::Pool) to
//! the shape a generic container wants: allocate/deallocate N elements of
//! type T, rejecting element-count * element-size overflow up front rather
//! than letting it wrap silently.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{MemResult, MemoryError};
use crate::pool::Pool;

/// Byte counts beyond this are never handed to the pool; 2^63 is the
/// ceiling the preferred-size law saturates at, and also the limit past
/// which a signed 64-bit byte count stops making sense.
const MAX_REPRESENTABLE_BYTES: u64 = 1 << 63;

#[derive(Clone)]
pub struct ContainerAllocator {
    pool: Arc<Pool>,
}

impl ContainerAllocator {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    fn checked_byte_count<T>(count: usize) -> MemResult<u64> {
        let elem_size = size_of::<T>().max(1) as u64;
        let count = count as u64;
        let bytes = count.checked_mul(elem_size).ok_or(MemoryError::SizeOverflow)?;
        if bytes >= MAX_REPRESENTABLE_BYTES {
            return Err(MemoryError::SizeOverflow);
        }
        Ok(bytes)
    }

    /// Allocates storage for `count` elements of `T`.
    pub fn allocate<T>(&self, count: usize) -> MemResult<NonNull<T>> {
        let bytes = Self::checked_byte_count::<T>(count)?;
        let ptr = self.pool.allocate(bytes)?;
        Ok(ptr.cast())
    }

    /// # Safety
    /// `ptr` and `count` must describe a live allocation this adapter
    /// produced with the same `T` and count.
    pub unsafe fn deallocate<T>(&self, ptr: NonNull<T>, count: usize) {
        let bytes = Self::checked_byte_count::<T>(count).unwrap_or(0);
        self.pool.free(ptr.cast(), bytes);
    }

    /// # Safety
    /// `ptr`/`old_count` must describe a live allocation of `T` elements
    /// this adapter produced.
    pub unsafe fn reallocate<T>(
        &self,
        ptr: NonNull<T>,
        old_count: usize,
        new_count: usize,
    ) -> MemResult<NonNull<T>> {
        let old_bytes = Self::checked_byte_count::<T>(old_count)?;
        let new_bytes = Self::checked_byte_count::<T>(new_count)?;
        let new_ptr = self.pool.reallocate(ptr.cast(), old_bytes, new_bytes)?;
        Ok(new_ptr.cast())
    }
}
