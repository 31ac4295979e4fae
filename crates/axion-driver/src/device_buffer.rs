//! Device-addressable buffers.
//!
//! A [`DeviceBuffer`] is the device-side view of mapped memory: an address
//! in the accelerator's virtual address space plus a size. It carries no
//! ownership; [`MappedDeviceBuffer`] pairs one with the address space that
//! produced it and releases the mapping when dropped.

use std::fmt;
use std::sync::Arc;

use axion_api::Result;
use log::warn;

use crate::memory::space::AddressSpace;

/// A device-visible address range.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceBuffer {
    valid: bool,
    device_address: u64,
    size_bytes: usize,
}

impl DeviceBuffer {
    /// Creates a buffer over `[device_address, device_address + size_bytes)`.
    pub fn new(device_address: u64, size_bytes: usize) -> Self {
        Self {
            valid: true,
            device_address,
            size_bytes,
        }
    }

    /// The invalid buffer.
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Returns true unless this is the invalid buffer.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Device virtual address of the first byte.
    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Returns the sub-range `[byte_offset, byte_offset + size_bytes)`.
    ///
    /// With `allow_overflow` the slice may extend past the end of this
    /// buffer; DMA hints for unpadded inputs read a little past the data to
    /// fill the hardware's fixed-size beat.
    ///
    /// # Panics
    ///
    /// Panics when the range overflows and `allow_overflow` is false.
    pub fn slice(&self, byte_offset: u64, size_bytes: usize, allow_overflow: bool) -> Self {
        if !allow_overflow {
            assert!(
                byte_offset as usize + size_bytes <= self.size_bytes,
                "slice [{byte_offset}, +{size_bytes}) exceeds device buffer of {} bytes",
                self.size_bytes
            );
        }
        Self {
            valid: self.valid,
            device_address: self.device_address + byte_offset,
            size_bytes,
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            write!(
                f,
                "DeviceBuffer(0x{:016x}, {} B)",
                self.device_address, self.size_bytes
            )
        } else {
            write!(f, "DeviceBuffer(invalid)")
        }
    }
}

/// A device buffer bundled with the duty to unmap it.
///
/// Dropping a still-mapped buffer unmaps it; failures at that point can only
/// be logged. Call [`MappedDeviceBuffer::unmap`] to observe the status.
pub struct MappedDeviceBuffer {
    device_buffer: DeviceBuffer,
    address_space: Option<Arc<dyn AddressSpace>>,
}

impl fmt::Debug for MappedDeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedDeviceBuffer")
            .field("device_buffer", &self.device_buffer)
            .field("mapped", &self.address_space.is_some())
            .finish()
    }
}

impl MappedDeviceBuffer {
    /// An empty mapping; unmapping is a no-op.
    pub fn invalid() -> Self {
        Self {
            device_buffer: DeviceBuffer::invalid(),
            address_space: None,
        }
    }

    /// Binds `device_buffer` to the address space that must release it.
    pub fn new(device_buffer: DeviceBuffer, address_space: Arc<dyn AddressSpace>) -> Self {
        Self {
            device_buffer,
            address_space: Some(address_space),
        }
    }

    /// The device-side view.
    pub fn device_buffer(&self) -> DeviceBuffer {
        self.device_buffer
    }

    /// Releases the mapping and reports the status.
    pub fn unmap(mut self) -> Result<()> {
        self.unmap_internal()
    }

    fn unmap_internal(&mut self) -> Result<()> {
        if let Some(space) = self.address_space.take() {
            let buffer = std::mem::take(&mut self.device_buffer);
            if buffer.is_valid() {
                return space.unmap(buffer);
            }
        }
        Ok(())
    }
}

impl Drop for MappedDeviceBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.unmap_internal() {
            warn!("leaked device mapping on drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_invalid() {
        assert!(!DeviceBuffer::default().is_valid());
        assert!(!DeviceBuffer::invalid().is_valid());
    }

    #[test]
    fn slice_offsets_address() {
        let buffer = DeviceBuffer::new(0x1000, 256);
        let slice = buffer.slice(16, 64, false);
        assert_eq!(slice.device_address(), 0x1010);
        assert_eq!(slice.size_bytes(), 64);
        assert!(slice.is_valid());
    }

    #[test]
    fn slice_overflow_is_opt_in() {
        let buffer = DeviceBuffer::new(0x1000, 64);
        let slice = buffer.slice(32, 64, true);
        assert_eq!(slice.size_bytes(), 64);
    }

    #[test]
    #[should_panic(expected = "exceeds device buffer")]
    fn slice_overflow_panics_without_opt_in() {
        DeviceBuffer::new(0x1000, 64).slice(32, 64, false);
    }
}
