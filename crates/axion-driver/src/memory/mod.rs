//! Device address-space management.
//!
//! Host memory becomes device-visible through an [`AddressSpace`]: the
//! buddy-allocated, MMU-backed space used by the MMIO transport, or the
//! no-op space used by the USB transport where the device addresses host
//! memory through bulk transfers rather than an IOMMU.

pub mod buddy;
pub mod dram;
pub mod host;
pub mod mmu;
pub mod nop;
pub mod space;
pub mod util;

pub use buddy::BuddyAddressSpace;
pub use dram::{DramAllocator, FakeDramAllocator, NullDramAllocator};
pub use host::HostAllocator;
pub use mmu::{FakeMmuMapper, MmuMapper};
pub use nop::NopAddressSpace;
pub use space::{AddressSpace, DmaDirection, MappingTypeHint};
