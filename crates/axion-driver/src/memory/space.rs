//! The address-space capability.

use axion_api::{Buffer, Error, Result};

use crate::device_buffer::DeviceBuffer;

/// Direction data moves during DMA; drives cache maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// CPU caches are flushed at mapping time.
    ToDevice,
    /// CPU caches are invalidated at unmapping time.
    FromDevice,
    /// Both of the above.
    Bidirectional,
}

/// Which page-table region a mapping should land in, for hardware with a
/// split simple/extended table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingTypeHint {
    /// No preference. Most mappings use this.
    Any,
    /// Prefer the small simple-address-space table.
    Simple,
    /// Prefer the large extended table.
    Extended,
}

/// A segment of the device's virtual address space.
///
/// Implementations are internally synchronized; mapping may be called from
/// any driver thread.
pub trait AddressSpace: Send + Sync {
    /// Maps `buffer` into the device's address space and returns the
    /// device-side view.
    fn map(
        &self,
        buffer: &Buffer,
        direction: DmaDirection,
        hint: MappingTypeHint,
    ) -> Result<DeviceBuffer>;

    /// Releases a mapping previously returned by [`AddressSpace::map`].
    /// All pages mapped by one `map` call are released together.
    fn unmap(&self, buffer: DeviceBuffer) -> Result<()>;

    /// Recovers the host buffer behind a device buffer.
    ///
    /// Only implementations that model the MMU directly can answer; the
    /// default is [`Error::Unimplemented`]. Transports without an IOMMU use
    /// this to reach the host bytes a DMA descriptor refers to.
    fn translate(&self, buffer: &DeviceBuffer) -> Result<Buffer> {
        let _ = buffer;
        Err(Error::unimplemented(
            "this address space cannot translate device addresses",
        ))
    }
}
