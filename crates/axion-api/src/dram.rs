//! On-device DRAM buffer handles.
//!
//! Some chips carry DRAM next to the core. Activations and parameters can be
//! staged there so inference skips the host-to-device upload. The allocator
//! living behind this handle is device-specific; the API only needs the
//! operations below.

use crate::error::Result;

/// A buffer resident in on-device DRAM.
///
/// Handles are shared (`Arc<dyn DramBuffer>`) between the user-visible
/// [`Buffer`](crate::Buffer) and the allocator that owns the backing block.
/// CPU access always goes through an explicit transfer; there is no host
/// mapping.
pub trait DramBuffer: Send + Sync {
    /// The file descriptor the kernel driver exported for this block.
    fn fd(&self) -> i32;

    /// Size of the block in bytes.
    fn size_bytes(&self) -> usize;

    /// Copies `size_bytes()` bytes from `src` into device DRAM.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `size_bytes()` bytes.
    unsafe fn read_from(&self, src: *const u8) -> Result<()>;

    /// Copies `size_bytes()` bytes from device DRAM to `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `size_bytes()` bytes.
    unsafe fn write_to(&self, dst: *mut u8) -> Result<()>;
}
