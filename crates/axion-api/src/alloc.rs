//! Aligned host memory blocks.
//!
//! The device DMAs directly out of host memory, so every buffer the runtime
//! allocates itself (parameter copies, instruction copies, staging for
//! batched outputs) must respect the chip's allocation alignment. An
//! [`AlignedBlock`] owns one such allocation; [`Buffer`](crate::Buffer)
//! values of the `Allocated` variant share it through an `Arc`.

use std::alloc::{self, Layout};

use log::warn;

/// An owned, aligned block of host memory.
///
/// The block is zero-initialised at allocation time so that padding bytes
/// DMA'd to the device never leak prior request contents.
pub struct AlignedBlock {
    ptr: *mut u8,
    size_bytes: usize,
    layout: Layout,
}

// SAFETY: The block owns its allocation exclusively; aliasing access from
// multiple threads is coordinated by the driver (buffers of one request are
// touched by one thread at a time).
unsafe impl Send for AlignedBlock {}
unsafe impl Sync for AlignedBlock {}

impl AlignedBlock {
    /// Allocates `size_bytes` bytes aligned to `alignment_bytes`.
    ///
    /// Returns `None` for a zero-sized request, an invalid alignment (zero or
    /// not a power of two) or allocation failure.
    pub fn new(size_bytes: usize, alignment_bytes: usize) -> Option<Self> {
        if size_bytes == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size_bytes, alignment_bytes).ok()?;
        // SAFETY: layout has non-zero size, checked above.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            warn!("aligned allocation of {size_bytes} bytes failed");
            return None;
        }
        Some(Self {
            ptr,
            size_bytes,
            layout,
        })
    }

    /// Returns the base pointer of the block.
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Returns the size of the block in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_aligned_and_zeroed() {
        let block = AlignedBlock::new(4096, 64).unwrap();
        assert_eq!(block.ptr() as usize % 64, 0);
        assert_eq!(block.size_bytes(), 4096);
        // SAFETY: freshly allocated block of 4096 bytes.
        let contents = unsafe { std::slice::from_raw_parts(block.ptr(), 4096) };
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(AlignedBlock::new(0, 64).is_none());
    }

    #[test]
    fn bad_alignment_is_rejected() {
        assert!(AlignedBlock::new(128, 3).is_none());
    }
}
