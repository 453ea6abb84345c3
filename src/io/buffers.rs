//! Page-aligned, pre-registered I/O buffer pools.
//!
//! Buffers are registered once with the kernel ring at engine construction
//! time (see [`crate::io::engine::IoEngine`]); callers obtain slices from a
//! [`BufferPool`] and never allocate memory on the I/O path. Read and write
//! pools are segregated, matching the "separate read and write buffer pools"
//! design decision in §4.2.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::chunk::offset::PAGE_SIZE;
use crate::error::{Result, TrieError};

/// A single `mmap`-backed, page-aligned region sized as a power-of-two
/// multiple of the page size. Freed via `munmap` on drop.
///
/// This is the Rust analogue of the original engine's `HugeMem`: one large
/// anonymous mapping sliced into fixed-size buffers, rather than one
/// allocation per buffer.
struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    fn new(len: usize) -> Result<Self> {
        debug_assert!(len % PAGE_SIZE == 0);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(TrieError::IoFailure(std::io::Error::last_os_error()));
        }
        Ok(MappedRegion {
            ptr: NonNull::new(ptr as *mut u8).unwrap(),
            len,
        })
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// A fixed-size, page-aligned buffer pool. Buffers are identified by index
/// (`0..count`), which doubles as the registered-buffer index the `io-uring`
/// fixed-buffer opcodes expect.
pub struct BufferPool {
    region: MappedRegion,
    buffer_size: usize,
    count: usize,
    free: Mutex<Vec<u16>>,
    in_use_bytes: AtomicUsize,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Result<Self> {
        if !buffer_size.is_power_of_two() || buffer_size < PAGE_SIZE {
            return Err(TrieError::IoFailure(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "buffer size must be a power-of-two page multiple",
            )));
        }
        if count > u16::MAX as usize {
            return Err(TrieError::IoFailure(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "too many buffers for a u16-indexed pool",
            )));
        }
        let region = MappedRegion::new(count * buffer_size)?;
        let free = (0..count as u16).rev().collect();
        Ok(BufferPool {
            region,
            buffer_size,
            count,
            free: Mutex::new(free),
            in_use_bytes: AtomicUsize::new(0),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.count
    }

    pub fn in_use_bytes(&self) -> usize {
        self.in_use_bytes.load(Ordering::Relaxed)
    }

    /// Base pointer and total length of the underlying registered region, for
    /// passing to `io_uring_register_buffers`.
    pub fn iovec(&self) -> (*mut u8, usize) {
        (self.region.as_mut_ptr(), self.count * self.buffer_size)
    }

    /// Acquires a free buffer slot. Returns `None` if the pool is exhausted;
    /// per §4.2 this is a fatal condition on the write path and the caller
    /// (the engine) is responsible for treating it as such.
    pub fn acquire(&self) -> Option<BufferSlot<'_>> {
        let idx = self.free.lock().pop()?;
        self.in_use_bytes
            .fetch_add(self.buffer_size, Ordering::Relaxed);
        Some(BufferSlot { pool: self, idx })
    }

    pub(crate) fn release(&self, idx: u16) {
        self.in_use_bytes
            .fetch_sub(self.buffer_size, Ordering::Relaxed);
        self.free.lock().push(idx);
    }

    pub(crate) unsafe fn slice_mut(&self, idx: u16) -> &mut [u8] {
        let base = self.region.as_mut_ptr().add(idx as usize * self.buffer_size);
        std::slice::from_raw_parts_mut(base, self.buffer_size)
    }
}

/// An owned handle to one buffer slot; returns it to the pool on drop.
pub struct BufferSlot<'a> {
    pool: &'a BufferPool,
    idx: u16,
}

impl<'a> BufferSlot<'a> {
    pub fn index(&self) -> u16 {
        self.idx
    }

    pub fn as_slice(&mut self) -> &mut [u8] {
        unsafe { self.pool.slice_mut(self.idx) }
    }
}

impl<'a> Drop for BufferSlot<'a> {
    fn drop(&mut self) {
        self.pool.release(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_cycles() {
        let pool = BufferPool::new(4, PAGE_SIZE).unwrap();
        let mut slots = Vec::new();
        for _ in 0..4 {
            slots.push(pool.acquire().unwrap());
        }
        assert!(pool.acquire().is_none());
        drop(slots);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(BufferPool::new(1, PAGE_SIZE + 1).is_err());
    }
}
