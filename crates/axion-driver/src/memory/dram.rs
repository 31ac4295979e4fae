//! On-device DRAM allocation.
//!
//! Chips with core-adjacent DRAM expose an allocator for it; chips without
//! use [`NullDramAllocator`], which refuses every request so callers fall
//! back to host memory. [`FakeDramAllocator`] backs "DRAM" with host memory
//! for tests.

use std::sync::{Arc, Mutex};

use axion_api::{DramBuffer, Error, Result};

/// Allocator for on-device DRAM blocks.
pub trait DramAllocator: Send + Sync {
    /// Brings the allocator online.
    fn open(&self) -> Result<()>;

    /// Shuts the allocator down.
    fn close(&self) -> Result<()>;

    /// Allocates a block of `size_bytes` bytes of on-device DRAM.
    fn allocate_buffer(&self, size_bytes: usize) -> Result<Arc<dyn DramBuffer>>;
}

/// Allocator for chips without on-device DRAM.
#[derive(Debug, Default)]
pub struct NullDramAllocator;

impl NullDramAllocator {
    /// Creates the null allocator.
    pub fn new() -> Self {
        Self
    }
}

impl DramAllocator for NullDramAllocator {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn allocate_buffer(&self, _size_bytes: usize) -> Result<Arc<dyn DramBuffer>> {
        Err(Error::unimplemented("this chip has no on-device DRAM"))
    }
}

/// Host-memory-backed DRAM buffer handed out by [`FakeDramAllocator`].
#[derive(Debug)]
pub struct FakeDramBuffer {
    fd: i32,
    storage: Mutex<Vec<u8>>,
}

impl DramBuffer for FakeDramBuffer {
    fn fd(&self) -> i32 {
        self.fd
    }

    fn size_bytes(&self) -> usize {
        self.storage.lock().unwrap().len()
    }

    unsafe fn read_from(&self, src: *const u8) -> Result<()> {
        let mut storage = self.storage.lock().unwrap();
        let len = storage.len();
        // SAFETY: caller guarantees src is valid for len bytes.
        unsafe { std::ptr::copy_nonoverlapping(src, storage.as_mut_ptr(), len) };
        Ok(())
    }

    unsafe fn write_to(&self, dst: *mut u8) -> Result<()> {
        let storage = self.storage.lock().unwrap();
        // SAFETY: caller guarantees dst is valid for len bytes.
        unsafe { std::ptr::copy_nonoverlapping(storage.as_ptr(), dst, storage.len()) };
        Ok(())
    }
}

/// Test allocator backing DRAM buffers with host memory.
#[derive(Debug, Default)]
pub struct FakeDramAllocator {
    next_fd: Mutex<i32>,
}

impl FakeDramAllocator {
    /// Creates the fake allocator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DramAllocator for FakeDramAllocator {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn allocate_buffer(&self, size_bytes: usize) -> Result<Arc<dyn DramBuffer>> {
        if size_bytes == 0 {
            return Err(Error::invalid_argument("cannot allocate 0 bytes of DRAM"));
        }
        let mut next_fd = self.next_fd.lock().unwrap();
        *next_fd += 1;
        Ok(Arc::new(FakeDramBuffer {
            fd: *next_fd,
            storage: Mutex::new(vec![0u8; size_bytes]),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_allocator_refuses() {
        let allocator = NullDramAllocator::new();
        allocator.open().unwrap();
        assert!(allocator.allocate_buffer(128).is_err());
        allocator.close().unwrap();
    }

    #[test]
    fn fake_dram_round_trips_data() {
        let allocator = FakeDramAllocator::new();
        let buffer = allocator.allocate_buffer(16).unwrap();
        let data: Vec<u8> = (0..16).collect();
        // SAFETY: data and readback are 16 bytes, matching the buffer size.
        unsafe {
            buffer.read_from(data.as_ptr()).unwrap();
            let mut readback = vec![0u8; 16];
            buffer.write_to(readback.as_mut_ptr()).unwrap();
            assert_eq!(readback, data);
        }
        assert!(buffer.fd() > 0);
    }
}
