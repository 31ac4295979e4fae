//! The identity address space.
//!
//! Transports without an IOMMU (the USB back-end) address host memory by
//! its raw pointer value: the "device address" of a buffer is the host
//! address, and translation is the inverse cast.

use axion_api::{Buffer, Error, Result};

use crate::device_buffer::DeviceBuffer;
use crate::memory::space::{AddressSpace, DmaDirection, MappingTypeHint};

/// Address space where `device_address == host_pointer`.
#[derive(Debug, Default)]
pub struct NopAddressSpace;

impl NopAddressSpace {
    /// Creates the identity address space.
    pub fn new() -> Self {
        Self
    }
}

impl AddressSpace for NopAddressSpace {
    fn map(
        &self,
        buffer: &Buffer,
        _direction: DmaDirection,
        _hint: MappingTypeHint,
    ) -> Result<DeviceBuffer> {
        if !buffer.is_valid() {
            return Err(Error::invalid_argument("cannot map an invalid buffer"));
        }
        Ok(DeviceBuffer::new(
            buffer.ptr() as u64,
            buffer.size_bytes(),
        ))
    }

    fn unmap(&self, _buffer: DeviceBuffer) -> Result<()> {
        Ok(())
    }

    fn translate(&self, buffer: &DeviceBuffer) -> Result<Buffer> {
        if !buffer.is_valid() {
            return Err(Error::invalid_argument(
                "cannot translate an invalid device buffer",
            ));
        }
        Ok(Buffer::from_ptr(
            buffer.device_address() as *mut u8,
            buffer.size_bytes(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_address_is_host_pointer() {
        let space = NopAddressSpace::new();
        let mut storage = [0u8; 64];
        let buffer = Buffer::from_ptr(storage.as_mut_ptr(), 64);
        let device = space
            .map(&buffer, DmaDirection::ToDevice, MappingTypeHint::Any)
            .unwrap();
        assert_eq!(device.device_address(), storage.as_ptr() as u64);

        let back = space.translate(&device).unwrap();
        assert_eq!(back.ptr(), buffer.ptr());
        space.unmap(device).unwrap();
    }
}
