//! Aligned host buffer allocation.
//!
//! Buffers the runtime allocates for itself (instruction copies, parameter
//! copies, staging for batched outputs) must respect the chip's allocation
//! alignment so they can be DMA'd without bounce copies.

use std::sync::Arc;

use axion_api::{AlignedBlock, Buffer};

/// Allocates zeroed host buffers at a fixed alignment.
#[derive(Debug, Clone, Copy)]
pub struct HostAllocator {
    alignment_bytes: usize,
}

impl HostAllocator {
    /// Creates an allocator aligning to `alignment_bytes` (a power of two).
    pub fn new(alignment_bytes: usize) -> Self {
        assert!(alignment_bytes.is_power_of_two());
        Self { alignment_bytes }
    }

    /// The allocator's alignment in bytes.
    pub fn alignment_bytes(&self) -> usize {
        self.alignment_bytes
    }

    /// Allocates a zeroed buffer of `size_bytes` bytes.
    ///
    /// A zero-byte request returns the invalid buffer; whether that is an
    /// error depends on where the buffer is used, so the decision is left
    /// to the caller.
    pub fn make_buffer(&self, size_bytes: usize) -> Buffer {
        match AlignedBlock::new(size_bytes, self.alignment_bytes) {
            Some(block) => Buffer::from_block(Arc::new(block)),
            None => Buffer::invalid(),
        }
    }
}
