//! Buddy-allocated device address space.
//!
//! Device virtual addresses are handed out by a power-of-two buddy
//! allocator with page-sized quanta; each allocation is then backed by MMU
//! mappings through the [`MmuMapper`] contract. Buddies merge on free, so
//! long-running drivers do not fragment the (small) simple address region.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use axion_api::{Buffer, Error, Result};
use log::trace;

use crate::device_buffer::DeviceBuffer;
use crate::memory::mmu::MmuMapper;
use crate::memory::space::{AddressSpace, DmaDirection, MappingTypeHint};
use crate::memory::util::{self, HOST_PAGE_SIZE};

/// Power-of-two free-list allocator over a device address range.
///
/// Block offsets are tracked per order; order 0 is one host page. A freed
/// block coalesces with its buddy when the buddy is free, restoring the
/// largest possible blocks.
struct BuddyAllocator {
    base: u64,
    size_bytes: u64,
    /// `free_lists[order]` holds offsets of free blocks of
    /// `HOST_PAGE_SIZE << order` bytes.
    free_lists: Vec<BTreeSet<u64>>,
}

impl BuddyAllocator {
    fn new(base: u64, size_bytes: u64) -> Self {
        assert!(util::is_page_aligned(base), "base must be page aligned");
        assert!(
            size_bytes.is_power_of_two() && size_bytes >= HOST_PAGE_SIZE,
            "size must be a power-of-two number of pages"
        );
        let max_order = (size_bytes / HOST_PAGE_SIZE).ilog2() as usize;
        let mut free_lists = vec![BTreeSet::new(); max_order + 1];
        free_lists[max_order].insert(0);
        Self {
            base,
            size_bytes,
            free_lists,
        }
    }

    fn order_for(&self, size_bytes: u64) -> Result<usize> {
        if size_bytes == 0 {
            return Err(Error::invalid_argument("cannot allocate 0 bytes"));
        }
        if size_bytes > self.size_bytes {
            return Err(Error::resource_exhausted(format!(
                "allocation of {size_bytes} bytes exceeds the address space"
            )));
        }
        let blocks = size_bytes.div_ceil(HOST_PAGE_SIZE).next_power_of_two();
        Ok(blocks.ilog2() as usize)
    }

    fn allocate(&mut self, size_bytes: u64) -> Result<u64> {
        let order = self.order_for(size_bytes)?;

        // Find the smallest free block that fits, splitting on the way down.
        let mut found = None;
        for candidate in order..self.free_lists.len() {
            if let Some(&offset) = self.free_lists[candidate].iter().next() {
                self.free_lists[candidate].remove(&offset);
                found = Some((candidate, offset));
                break;
            }
        }
        let (mut current, offset) = found.ok_or_else(|| {
            Error::resource_exhausted(format!(
                "no free device address block for {size_bytes} bytes"
            ))
        })?;
        while current > order {
            current -= 1;
            let buddy = offset + (HOST_PAGE_SIZE << current);
            self.free_lists[current].insert(buddy);
        }
        Ok(self.base + offset)
    }

    fn free(&mut self, address: u64, size_bytes: u64) -> Result<()> {
        let order = self.order_for(size_bytes)?;
        let mut offset = address
            .checked_sub(self.base)
            .ok_or_else(|| Error::invalid_argument("address below the address space base"))?;
        let block = HOST_PAGE_SIZE << order;
        if offset % block != 0 {
            return Err(Error::invalid_argument(format!(
                "freed address 0x{address:x} is not aligned to its block size"
            )));
        }

        // Merge with the buddy while it is free.
        let mut current = order;
        while current < self.free_lists.len() - 1 {
            let buddy = offset ^ (HOST_PAGE_SIZE << current);
            if !self.free_lists[current].remove(&buddy) {
                break;
            }
            offset = offset.min(buddy);
            current += 1;
        }
        self.free_lists[current].insert(offset);
        Ok(())
    }
}

/// An [`AddressSpace`] that allocates device addresses with a buddy
/// allocator and backs them through an [`MmuMapper`].
pub struct BuddyAddressSpace {
    allocator: Mutex<BuddyAllocator>,
    mmu: Arc<dyn MmuMapper>,
}

impl BuddyAddressSpace {
    /// Manages `[base, base + size_bytes)` of device address space. `base`
    /// must be page aligned and `size_bytes` a power-of-two number of
    /// pages.
    pub fn new(base: u64, size_bytes: u64, mmu: Arc<dyn MmuMapper>) -> Self {
        Self {
            allocator: Mutex::new(BuddyAllocator::new(base, size_bytes)),
            mmu,
        }
    }
}

impl AddressSpace for BuddyAddressSpace {
    fn map(
        &self,
        buffer: &Buffer,
        direction: DmaDirection,
        _hint: MappingTypeHint,
    ) -> Result<DeviceBuffer> {
        if !buffer.is_valid() {
            return Err(Error::invalid_argument("cannot map an invalid buffer"));
        }
        if buffer.size_bytes() == 0 {
            return Err(Error::invalid_argument("cannot map 0 bytes"));
        }
        let host = if buffer.is_ptr_type() {
            buffer.ptr() as u64
        } else {
            0
        };
        let pages = util::num_pages(host, buffer.size_bytes());
        let allocation_size = pages * HOST_PAGE_SIZE;

        let mut allocator = self.allocator.lock().unwrap();
        let device_va = allocator.allocate(allocation_size)?;
        if let Err(err) = self.mmu.map(buffer, device_va, direction) {
            allocator
                .free(device_va, allocation_size)
                .expect("fresh allocation must free");
            return Err(err);
        }
        trace!(
            "mapped {} bytes at device 0x{:016x} ({} pages)",
            buffer.size_bytes(),
            device_va + util::page_offset(host),
            pages
        );
        Ok(DeviceBuffer::new(
            device_va + util::page_offset(host),
            buffer.size_bytes(),
        ))
    }

    fn unmap(&self, buffer: DeviceBuffer) -> Result<()> {
        let device_address = buffer.device_address();
        let pages = util::num_pages(device_address, buffer.size_bytes());
        let aligned_va = util::page_address(device_address);

        let mut allocator = self.allocator.lock().unwrap();
        self.mmu.unmap(aligned_va, pages)?;
        allocator.free(aligned_va, pages * HOST_PAGE_SIZE)
    }

    fn translate(&self, buffer: &DeviceBuffer) -> Result<Buffer> {
        self.mmu
            .translate(buffer.device_address(), buffer.size_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mmu::FakeMmuMapper;
    use proptest::prelude::*;

    fn space_with_fake_mmu(size: u64) -> (BuddyAddressSpace, Arc<FakeMmuMapper>) {
        let mmu = Arc::new(FakeMmuMapper::new());
        mmu.open(256).unwrap();
        (BuddyAddressSpace::new(0, size, mmu.clone() as Arc<dyn MmuMapper>), mmu)
    }

    #[test]
    fn allocator_splits_and_merges() {
        let mut allocator = BuddyAllocator::new(0, 16 * HOST_PAGE_SIZE);
        let a = allocator.allocate(HOST_PAGE_SIZE).unwrap();
        let b = allocator.allocate(2 * HOST_PAGE_SIZE).unwrap();
        let c = allocator.allocate(HOST_PAGE_SIZE).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        allocator.free(a, HOST_PAGE_SIZE).unwrap();
        allocator.free(c, HOST_PAGE_SIZE).unwrap();
        allocator.free(b, 2 * HOST_PAGE_SIZE).unwrap();
        // Everything merged back: a full-size allocation succeeds.
        let full = allocator.allocate(16 * HOST_PAGE_SIZE).unwrap();
        assert_eq!(full, 0);
    }

    #[test]
    fn exhaustion_reports_resource_exhausted() {
        let mut allocator = BuddyAllocator::new(0, 2 * HOST_PAGE_SIZE);
        allocator.allocate(2 * HOST_PAGE_SIZE).unwrap();
        let err = allocator.allocate(HOST_PAGE_SIZE).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn map_unmap_restores_state() {
        let (space, mmu) = space_with_fake_mmu(64 * HOST_PAGE_SIZE);
        let mut storage = vec![0u8; 4096 * 2];
        let buffer = Buffer::from_ptr(storage.as_mut_ptr(), storage.len());
        let device = space
            .map(&buffer, DmaDirection::ToDevice, MappingTypeHint::Any)
            .unwrap();
        assert!(device.is_valid());
        assert!(mmu.num_mapped_pages() > 0);
        space.unmap(device).unwrap();
        assert_eq!(mmu.num_mapped_pages(), 0);
    }

    #[test]
    fn mapped_page_offset_is_preserved() {
        let (space, _mmu) = space_with_fake_mmu(64 * HOST_PAGE_SIZE);
        let mut storage = vec![0u8; 8192];
        // Deliberately misaligned start.
        let start = unsafe { storage.as_mut_ptr().add(123) };
        let buffer = Buffer::from_ptr(start, 4096);
        let device = space
            .map(&buffer, DmaDirection::ToDevice, MappingTypeHint::Any)
            .unwrap();
        assert_eq!(
            util::page_offset(device.device_address()),
            util::page_offset(start as u64)
        );
        space.unmap(device).unwrap();
    }

    proptest! {
        #[test]
        fn random_allocation_order_always_merges_back(
            sizes in proptest::collection::vec(1u64..5, 1..8)
        ) {
            let mut allocator = BuddyAllocator::new(0, 64 * HOST_PAGE_SIZE);
            let mut live = Vec::new();
            for pages in sizes {
                let bytes = pages * HOST_PAGE_SIZE;
                live.push((allocator.allocate(bytes).unwrap(), bytes));
            }
            for (address, bytes) in live {
                allocator.free(address, bytes).unwrap();
            }
            prop_assert_eq!(allocator.allocate(64 * HOST_PAGE_SIZE).unwrap(), 0);
        }
    }
}
