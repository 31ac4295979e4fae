//! Uniform buffer handle over the memory types the runtime moves data
//! through.
//!
//! A [`Buffer`] is a tagged variant over host memory (wrapped or
//! runtime-allocated), shared-memory file descriptors and on-device DRAM.
//! Cloning an `Allocated` or `Dram` buffer aliases the underlying block
//! (shared lifetime through the owning `Arc`); taking a buffer with
//! [`std::mem::take`] leaves the source `Invalid`, mirroring move-only
//! ownership of the backing resource.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::alloc::AlignedBlock;
use crate::dram::DramBuffer;
use crate::error::{Error, Result};

/// Named, batched collection of buffers (layer name -> batch index -> buffer).
pub type NamedBufferMap = HashMap<String, Vec<Buffer>>;

/// Backing storage of a [`Buffer`].
#[derive(Clone)]
enum Repr {
    /// Non-existent buffer.
    Invalid,
    /// Wraps host memory owned by the caller.
    Wrapped { ptr: *mut u8 },
    /// Wraps an aligned block owned by the runtime. `offset` positions a
    /// slice within the shared block.
    Allocated { block: Arc<AlignedBlock>, offset: usize },
    /// Wraps an mmap-able shared-memory file descriptor (not owned).
    Fd { fd: i32 },
    /// On-device DRAM managed by the runtime.
    Dram { buffer: Arc<dyn DramBuffer> },
    /// Externally-owned on-device DRAM referenced by file descriptor.
    DramWrapped { fd: i32 },
}

/// A uniform handle over the buffer types the driver accepts.
#[derive(Clone)]
pub struct Buffer {
    repr: Repr,
    size_bytes: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Buffer {
    /// Returns an invalid, non-existent buffer.
    pub fn invalid() -> Self {
        Self {
            repr: Repr::Invalid,
            size_bytes: 0,
        }
    }

    /// Wraps existing host memory. The caller keeps ownership and must keep
    /// the memory valid for the life of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is null; a null wrap is always a caller bug.
    pub fn from_ptr(ptr: *mut u8, size_bytes: usize) -> Self {
        assert!(!ptr.is_null(), "cannot wrap a null host pointer");
        Self {
            repr: Repr::Wrapped { ptr },
            size_bytes,
        }
    }

    /// Wraps a runtime-allocated aligned block. The buffer spans the whole
    /// block; clones alias it.
    pub fn from_block(block: Arc<AlignedBlock>) -> Self {
        let size_bytes = block.size_bytes();
        Self {
            repr: Repr::Allocated { block, offset: 0 },
            size_bytes,
        }
    }

    /// Wraps an existing shared-memory file descriptor. When
    /// `on_device_dram` is true the descriptor refers to externally-owned
    /// on-device DRAM.
    pub fn from_fd(fd: i32, size_bytes: usize, on_device_dram: bool) -> Self {
        let repr = if on_device_dram {
            Repr::DramWrapped { fd }
        } else {
            Repr::Fd { fd }
        };
        Self { repr, size_bytes }
    }

    /// Wraps a runtime-managed on-device DRAM buffer.
    pub fn from_dram(buffer: Arc<dyn DramBuffer>) -> Self {
        let size_bytes = buffer.size_bytes();
        Self {
            repr: Repr::Dram { buffer },
            size_bytes,
        }
    }

    /// Size of this buffer in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Returns true unless this is the invalid buffer.
    pub fn is_valid(&self) -> bool {
        !matches!(self.repr, Repr::Invalid)
    }

    /// Returns true if the buffer is backed by host memory the CPU can
    /// address directly (wrapped or runtime-allocated).
    pub fn is_ptr_type(&self) -> bool {
        matches!(self.repr, Repr::Wrapped { .. } | Repr::Allocated { .. })
    }

    /// Returns true if the buffer is backed by a file descriptor.
    pub fn is_fd_backed(&self) -> bool {
        matches!(
            self.repr,
            Repr::Fd { .. } | Repr::Dram { .. } | Repr::DramWrapped { .. }
        )
    }

    /// Returns true if the buffer lives in on-device DRAM.
    pub fn is_dram_type(&self) -> bool {
        matches!(self.repr, Repr::Dram { .. } | Repr::DramWrapped { .. })
    }

    /// Returns true if the backing memory is owned by the runtime rather
    /// than wrapped from the caller.
    pub fn is_managed_type(&self) -> bool {
        matches!(self.repr, Repr::Allocated { .. } | Repr::Dram { .. })
    }

    /// Returns the host pointer.
    ///
    /// # Panics
    ///
    /// Panics for fd- and DRAM-backed buffers; those must be mapped before
    /// CPU access.
    pub fn ptr(&self) -> *mut u8 {
        match &self.repr {
            Repr::Wrapped { ptr } => *ptr,
            Repr::Allocated { block, offset } => {
                // SAFETY: offset stays within the block; enforced by slice().
                unsafe { block.ptr().add(*offset) }
            }
            _ => panic!("ptr() called on a non-host-memory buffer"),
        }
    }

    /// Returns the file descriptor.
    ///
    /// # Panics
    ///
    /// Panics unless the buffer is fd- or DRAM-backed.
    pub fn fd(&self) -> i32 {
        match &self.repr {
            Repr::Fd { fd } | Repr::DramWrapped { fd } => *fd,
            Repr::Dram { buffer } => buffer.fd(),
            _ => panic!("fd() called on a non-fd-backed buffer"),
        }
    }

    /// Returns the runtime-managed DRAM handle behind this buffer.
    pub fn dram_buffer(&self) -> Result<Arc<dyn DramBuffer>> {
        match &self.repr {
            Repr::Dram { buffer } => Ok(Arc::clone(buffer)),
            _ => Err(Error::failed_precondition(
                "buffer is not runtime-managed on-device DRAM",
            )),
        }
    }

    /// Returns a sub-range of this buffer. The slice shares the backing
    /// storage of the original; managed variants gain another owner.
    ///
    /// # Panics
    ///
    /// Panics when the range exceeds the buffer, or on a non-zero offset
    /// into an fd-backed buffer (those cannot be windowed without a
    /// mapping).
    pub fn slice(&self, offset: usize, length: usize) -> Buffer {
        assert!(
            offset + length <= self.size_bytes,
            "slice [{}, {}) exceeds buffer of {} bytes",
            offset,
            offset + length,
            self.size_bytes
        );
        assert!(
            !self.is_fd_backed() || offset == 0,
            "fd-backed buffers can only be sliced at offset 0"
        );

        let repr = match &self.repr {
            Repr::Invalid => Repr::Invalid,
            Repr::Wrapped { ptr } => Repr::Wrapped {
                // SAFETY: offset is within the wrapped range, checked above.
                ptr: unsafe { ptr.add(offset) },
            },
            Repr::Allocated { block, offset: base } => Repr::Allocated {
                block: Arc::clone(block),
                offset: base + offset,
            },
            Repr::Fd { fd } => Repr::Fd { fd: *fd },
            Repr::Dram { buffer } => Repr::Dram {
                buffer: Arc::clone(buffer),
            },
            Repr::DramWrapped { fd } => Repr::DramWrapped { fd: *fd },
        };
        Buffer {
            repr,
            size_bytes: length,
        }
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        if self.size_bytes != other.size_bytes {
            return false;
        }
        match (&self.repr, &other.repr) {
            (Repr::Invalid, Repr::Invalid) => true,
            (Repr::Wrapped { ptr: a }, Repr::Wrapped { ptr: b }) => a == b,
            (
                Repr::Allocated { block: a, offset: ao },
                Repr::Allocated { block: b, offset: bo },
            ) => Arc::ptr_eq(a, b) && ao == bo,
            (Repr::Fd { fd: a }, Repr::Fd { fd: b }) => a == b,
            (Repr::Dram { buffer: a }, Repr::Dram { buffer: b }) => Arc::ptr_eq(a, b),
            (Repr::DramWrapped { fd: a }, Repr::DramWrapped { fd: b }) => a == b,
            _ => false,
        }
    }
}

impl Eq for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Invalid => write!(f, "Buffer(invalid)"),
            Repr::Wrapped { ptr } => write!(f, "Buffer(ptr={ptr:p}, {} B)", self.size_bytes),
            Repr::Allocated { .. } => {
                write!(f, "Buffer(allocated ptr={:p}, {} B)", self.ptr(), self.size_bytes)
            }
            Repr::Fd { fd } => write!(f, "Buffer(fd={fd}, {} B)", self.size_bytes),
            Repr::Dram { buffer } => write!(f, "Buffer(dram fd={}, {} B)", buffer.fd(), self.size_bytes),
            Repr::DramWrapped { fd } => {
                write!(f, "Buffer(dram-wrapped fd={fd}, {} B)", self.size_bytes)
            }
        }
    }
}

// SAFETY: The wrapped pointer is owned by the caller who promises validity
// for the buffer's lifetime; all other variants hold Send + Sync owners.
// Concurrent access to the pointed-to memory is coordinated by the driver.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocated(size: usize) -> Buffer {
        Buffer::from_block(Arc::new(AlignedBlock::new(size, 64).unwrap()))
    }

    #[test]
    fn default_is_invalid() {
        let buffer = Buffer::default();
        assert!(!buffer.is_valid());
        assert_eq!(buffer.size_bytes(), 0);
    }

    #[test]
    fn take_leaves_invalid_behind() {
        let mut buffer = allocated(128);
        let moved = std::mem::take(&mut buffer);
        assert!(moved.is_valid());
        assert!(!buffer.is_valid());
    }

    #[test]
    fn clone_aliases_allocated_storage() {
        let buffer = allocated(256);
        let alias = buffer.clone();
        assert_eq!(buffer, alias);
        assert_eq!(buffer.ptr(), alias.ptr());
    }

    #[test]
    fn slice_of_allocated_offsets_pointer() {
        let buffer = allocated(256);
        let slice = buffer.slice(64, 32);
        assert_eq!(slice.size_bytes(), 32);
        assert_eq!(slice.ptr() as usize, buffer.ptr() as usize + 64);
        assert!(slice.is_managed_type());
    }

    #[test]
    #[should_panic(expected = "exceeds buffer")]
    fn slice_out_of_range_panics() {
        allocated(64).slice(32, 64);
    }

    #[test]
    #[should_panic(expected = "offset 0")]
    fn slice_fd_backed_with_offset_panics() {
        Buffer::from_fd(3, 128, false).slice(8, 8);
    }

    #[test]
    #[should_panic(expected = "non-host-memory")]
    fn ptr_on_fd_buffer_panics() {
        let _ = Buffer::from_fd(3, 128, false).ptr();
    }

    #[test]
    fn wrapped_buffers_compare_by_pointer() {
        let mut storage = [0u8; 64];
        let a = Buffer::from_ptr(storage.as_mut_ptr(), 64);
        let b = Buffer::from_ptr(storage.as_mut_ptr(), 64);
        let c = a.slice(8, 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn dram_wrapped_classification() {
        let buffer = Buffer::from_fd(7, 512, true);
        assert!(buffer.is_dram_type());
        assert!(buffer.is_fd_backed());
        assert!(!buffer.is_managed_type());
        assert!(buffer.dram_buffer().is_err());
        assert_eq!(buffer.fd(), 7);
    }
}
