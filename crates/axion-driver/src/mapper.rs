//! Per-request device buffer mapping with page coalescing.
//!
//! One [`DeviceBufferMapper`] carries every mapping a sub-request needs:
//! inputs, outputs, scratch and instructions. Host-memory buffers that
//! share or abut pages are merged into a single `map` call; the underlying
//! address space only deals in whole pages, so mapping each buffer alone
//! would both waste page-table entries and double-map shared pages.

use std::collections::HashMap;
use std::sync::Arc;

use axion_api::{Buffer, Error, Result, buffer::NamedBufferMap, error::accumulate};
use log::trace;

use crate::device_buffer::DeviceBuffer;
use crate::memory::space::{AddressSpace, DmaDirection, MappingTypeHint};
use crate::memory::util;

/// Named, batched device buffers (layer name -> batch index -> buffer).
pub type NamedDeviceBufferMap = HashMap<String, Vec<DeviceBuffer>>;

/// Maps and owns all device buffers of one sub-request.
pub struct DeviceBufferMapper {
    address_space: Arc<dyn AddressSpace>,
    inputs: NamedDeviceBufferMap,
    input_mappings: Vec<DeviceBuffer>,
    outputs: NamedDeviceBufferMap,
    output_mappings: Vec<DeviceBuffer>,
    scratch: DeviceBuffer,
    instructions: Vec<DeviceBuffer>,
    instruction_mappings: Vec<DeviceBuffer>,
}

impl DeviceBufferMapper {
    /// Creates an empty mapper over `address_space`.
    pub fn new(address_space: Arc<dyn AddressSpace>) -> Self {
        Self {
            address_space,
            inputs: NamedDeviceBufferMap::new(),
            input_mappings: Vec::new(),
            outputs: NamedDeviceBufferMap::new(),
            output_mappings: Vec::new(),
            scratch: DeviceBuffer::invalid(),
            instructions: Vec::new(),
            instruction_mappings: Vec::new(),
        }
    }

    /// Maps all input buffers, coalescing page-adjacent ones.
    pub fn map_inputs(&mut self, buffers: &NamedBufferMap) -> Result<()> {
        let (user, mappings) =
            self.map_multiple(buffers, DmaDirection::ToDevice)?;
        self.inputs = user;
        self.input_mappings = mappings;
        Ok(())
    }

    /// Maps all output buffers, coalescing page-adjacent ones.
    pub fn map_outputs(&mut self, buffers: &NamedBufferMap) -> Result<()> {
        let (user, mappings) =
            self.map_multiple(buffers, DmaDirection::FromDevice)?;
        self.outputs = user;
        self.output_mappings = mappings;
        Ok(())
    }

    /// Maps the scratch buffer, when the executable uses one.
    pub fn map_scratch(&mut self, buffer: &Buffer) -> Result<()> {
        debug_assert!(!self.scratch.is_valid());
        self.scratch = self.map_one(buffer, DmaDirection::Bidirectional)?;
        if self.scratch.is_valid() {
            trace!(
                "mapped scratch: {buffer:?} -> 0x{:016x}",
                self.scratch.device_address()
            );
        }
        Ok(())
    }

    /// Maps the patched instruction buffers. Must happen after patching so
    /// the flush at map time covers the patched bytes.
    pub fn map_instructions(&mut self, buffers: &[Buffer]) -> Result<()> {
        if !self.instruction_mappings.is_empty() {
            return Err(Error::invalid_argument("instructions are already mapped"));
        }
        let mut named = NamedBufferMap::new();
        named.insert("instructions".to_string(), buffers.to_vec());
        let (mut user, mappings) = self.map_multiple(&named, DmaDirection::ToDevice)?;
        self.instructions = user.remove("instructions").unwrap_or_default();
        self.instruction_mappings = mappings;
        Ok(())
    }

    /// Releases every mapping, instructions first, then scratch, inputs and
    /// outputs. Failures accumulate; every release is attempted.
    pub fn unmap_all(&mut self) -> Result<()> {
        let mut status = Ok(());
        accumulate(
            &mut status,
            Self::unmap_multiple(&self.address_space, &mut self.instruction_mappings),
        );
        let scratch = std::mem::take(&mut self.scratch);
        if scratch.is_valid() {
            accumulate(&mut status, self.address_space.unmap(scratch));
        }
        accumulate(
            &mut status,
            Self::unmap_multiple(&self.address_space, &mut self.input_mappings),
        );
        accumulate(
            &mut status,
            Self::unmap_multiple(&self.address_space, &mut self.output_mappings),
        );

        self.inputs.clear();
        self.outputs.clear();
        self.instructions.clear();
        status
    }

    /// Device buffer of one input batch element.
    pub fn input_device_buffer(&self, name: &str, batch: usize) -> Result<DeviceBuffer> {
        Self::lookup(&self.inputs, name, batch, "input")
    }

    /// Device buffer of one output batch element.
    pub fn output_device_buffer(&self, name: &str, batch: usize) -> Result<DeviceBuffer> {
        Self::lookup(&self.outputs, name, batch, "output")
    }

    /// All mapped input device buffers.
    pub fn input_device_buffers(&self) -> &NamedDeviceBufferMap {
        &self.inputs
    }

    /// All mapped output device buffers.
    pub fn output_device_buffers(&self) -> &NamedDeviceBufferMap {
        &self.outputs
    }

    /// The scratch device buffer; invalid when the executable has none.
    pub fn scratch_device_buffer(&self) -> DeviceBuffer {
        self.scratch
    }

    /// Device buffers of the instruction chunks, in chunk order.
    pub fn instruction_device_buffers(&self) -> &[DeviceBuffer] {
        &self.instructions
    }

    /// Device buffer of one instruction chunk.
    pub fn instruction_device_buffer(&self, chunk: usize) -> Result<DeviceBuffer> {
        self.instructions.get(chunk).copied().ok_or_else(|| {
            Error::not_found(format!("instruction chunk {chunk} is not mapped"))
        })
    }

    fn lookup(
        map: &NamedDeviceBufferMap,
        name: &str,
        batch: usize,
        what: &str,
    ) -> Result<DeviceBuffer> {
        map.get(name)
            .and_then(|buffers| buffers.get(batch))
            .copied()
            .ok_or_else(|| {
                Error::not_found(format!("{what} \"{name}\" batch {batch} is not mapped"))
            })
    }

    fn map_one(&self, buffer: &Buffer, direction: DmaDirection) -> Result<DeviceBuffer> {
        if !buffer.is_valid() {
            return Ok(DeviceBuffer::invalid());
        }
        self.address_space
            .map(buffer, direction, MappingTypeHint::Any)
    }

    /// Maps a named buffer collection with coalescing. Returns the
    /// per-buffer device views and the raw mappings to release later.
    ///
    /// Coalescing works on sorted page-range endpoints. All addresses are
    /// page aligned, so the low bit is free to tag exclusive range ends;
    /// sorting then puts a start before an end at the same address, which
    /// merges exactly the buffers that share or abut pages:
    ///
    /// 1. For each host-memory buffer push `page_start` and
    ///    `page_end | 1`.
    /// 2. Sort. Walk with a depth counter: +1 on starts, -1 on ends. Each
    ///    return to zero closes one merged interval; map it with a single
    ///    call.
    /// 3. Each buffer then finds its interval by binary search and derives
    ///    its device address from the interval's.
    fn map_multiple(
        &self,
        buffers: &NamedBufferMap,
        direction: DmaDirection,
    ) -> Result<(NamedDeviceBufferMap, Vec<DeviceBuffer>)> {
        const END_OF_RANGE_BIT: u64 = 1;

        let ptr_buffers: Vec<&Buffer> = buffers
            .values()
            .flatten()
            .filter(|buffer| buffer.is_ptr_type())
            .collect();

        let mut endpoints = Vec::with_capacity(ptr_buffers.len() * 2);
        for buffer in &ptr_buffers {
            let host = buffer.ptr() as u64;
            let start = util::page_address(host);
            let end = start
                + util::num_pages(host, buffer.size_bytes()) * util::HOST_PAGE_SIZE
                + END_OF_RANGE_BIT;
            endpoints.push(start);
            endpoints.push(end);
        }
        endpoints.sort_unstable();

        // Merged interval start addresses, parallel to `mapped`.
        let mut merged_starts: Vec<u64> = Vec::with_capacity(ptr_buffers.len());
        let mut mapped: Vec<DeviceBuffer> = Vec::with_capacity(ptr_buffers.len());

        let mut cleanup = MappingCleanup {
            address_space: &self.address_space,
            mapped: &mut mapped,
            armed: true,
        };

        let mut depth = 0i64;
        for endpoint in endpoints {
            if endpoint & END_OF_RANGE_BIT != 0 {
                depth -= 1;
                debug_assert!(depth >= 0);
                if depth == 0 {
                    let start = *merged_starts.last().unwrap();
                    let end = endpoint - END_OF_RANGE_BIT;
                    let merged =
                        Buffer::from_ptr(start as *mut u8, (end - start) as usize);
                    let device = self.address_space.map(
                        &merged,
                        direction,
                        MappingTypeHint::Any,
                    )?;
                    cleanup.mapped.push(device);
                }
            } else {
                if depth == 0 {
                    merged_starts.push(endpoint);
                }
                depth += 1;
            }
        }

        // Locate each user buffer inside its merged interval.
        let mut user = NamedDeviceBufferMap::new();
        for (name, batch) in buffers {
            for buffer in batch {
                let device_buffer = if buffer.is_ptr_type() {
                    let host = buffer.ptr() as u64;
                    let index = match merged_starts.binary_search(&host) {
                        Ok(exact) => exact,
                        Err(insertion) => insertion - 1,
                    };
                    let interval = cleanup.mapped[index];
                    DeviceBuffer::new(
                        interval.device_address() + (host - merged_starts[index]),
                        buffer.size_bytes(),
                    )
                } else {
                    let device = self.map_one(buffer, direction)?;
                    cleanup.mapped.push(device);
                    device
                };
                trace!(
                    "mapped \"{name}\": {buffer:?} -> 0x{:016x}, {} bytes",
                    device_buffer.device_address(),
                    device_buffer.size_bytes()
                );
                user.entry(name.clone()).or_default().push(device_buffer);
            }
        }

        cleanup.armed = false;
        drop(cleanup);
        Ok((user, mapped))
    }

    fn unmap_multiple(
        address_space: &Arc<dyn AddressSpace>,
        mappings: &mut Vec<DeviceBuffer>,
    ) -> Result<()> {
        let mut status = Ok(());
        for mapping in mappings.drain(..) {
            if mapping.is_valid() {
                accumulate(&mut status, address_space.unmap(mapping));
            }
        }
        status
    }
}

/// Releases partially-built mappings when `map_multiple` bails early.
struct MappingCleanup<'a> {
    address_space: &'a Arc<dyn AddressSpace>,
    mapped: &'a mut Vec<DeviceBuffer>,
    armed: bool,
}

impl Drop for MappingCleanup<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for mapping in self.mapped.drain(..) {
            if mapping.is_valid() {
                let _ = self.address_space.unmap(mapping);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::buddy::BuddyAddressSpace;
    use crate::memory::mmu::{FakeMmuMapper, MmuMapper};
    use crate::memory::util::HOST_PAGE_SIZE;

    fn make_space() -> (Arc<dyn AddressSpace>, Arc<FakeMmuMapper>) {
        let mmu = Arc::new(FakeMmuMapper::new());
        mmu.open(256).unwrap();
        let space = BuddyAddressSpace::new(
            0,
            1024 * HOST_PAGE_SIZE,
            Arc::clone(&mmu) as Arc<dyn MmuMapper>,
        );
        (Arc::new(space), mmu)
    }

    #[test]
    fn adjacent_buffers_share_one_mapping() {
        let (space, mmu) = make_space();
        let mut storage = vec![0u8; 3 * HOST_PAGE_SIZE as usize];
        // Carve two buffers out of the same page-contiguous storage.
        let base = storage.as_mut_ptr();
        let mut buffers = NamedBufferMap::new();
        buffers.insert(
            "a".to_string(),
            vec![Buffer::from_ptr(base, HOST_PAGE_SIZE as usize)],
        );
        buffers.insert(
            "b".to_string(),
            // SAFETY: within the 3-page storage.
            vec![Buffer::from_ptr(
                unsafe { base.add(HOST_PAGE_SIZE as usize) },
                HOST_PAGE_SIZE as usize,
            )],
        );

        let mut mapper = DeviceBufferMapper::new(Arc::clone(&space));
        mapper.map_inputs(&buffers).unwrap();

        // One merged interval, page aligned, covering both buffers.
        assert_eq!(mapper.input_mappings.len(), 1);
        let a = mapper.input_device_buffer("a", 0).unwrap();
        let b = mapper.input_device_buffer("b", 0).unwrap();
        assert_eq!(
            b.device_address(),
            a.device_address() + HOST_PAGE_SIZE
        );

        mapper.unmap_all().unwrap();
        assert_eq!(mmu.num_mapped_pages(), 0);
    }

    #[test]
    fn distant_buffers_map_separately() {
        let (space, mmu) = make_space();
        let mut first = vec![0u8; HOST_PAGE_SIZE as usize];
        let mut gap = vec![0u8; 64 * HOST_PAGE_SIZE as usize];
        let mut second = vec![0u8; HOST_PAGE_SIZE as usize];
        // Keep `gap` alive so the two buffers stay far apart.
        let _ = gap.as_mut_ptr();

        let mut buffers = NamedBufferMap::new();
        buffers.insert(
            "a".to_string(),
            vec![Buffer::from_ptr(first.as_mut_ptr(), first.len())],
        );
        buffers.insert(
            "b".to_string(),
            vec![Buffer::from_ptr(second.as_mut_ptr(), second.len())],
        );

        let mut mapper = DeviceBufferMapper::new(Arc::clone(&space));
        mapper.map_inputs(&buffers).unwrap();
        assert_eq!(mapper.input_mappings.len(), 2);
        mapper.unmap_all().unwrap();
        assert_eq!(mmu.num_mapped_pages(), 0);
    }

    #[test]
    fn one_aligned_page_maps_exactly() {
        let (space, mmu) = make_space();
        let allocator = crate::memory::host::HostAllocator::new(HOST_PAGE_SIZE as usize);
        let page = allocator.make_buffer(HOST_PAGE_SIZE as usize);

        let mut buffers = NamedBufferMap::new();
        buffers.insert("in".to_string(), vec![page.clone()]);

        let mut mapper = DeviceBufferMapper::new(Arc::clone(&space));
        mapper.map_inputs(&buffers).unwrap();
        assert_eq!(mapper.input_mappings.len(), 1);
        assert_eq!(
            mapper.input_mappings[0].size_bytes(),
            HOST_PAGE_SIZE as usize
        );
        assert_eq!(mmu.num_mapped_pages(), 1);
        mapper.unmap_all().unwrap();
        assert_eq!(mmu.num_mapped_pages(), 0);
    }

    #[test]
    fn overlapping_buffers_do_not_double_map() {
        let (space, mmu) = make_space();
        let mut storage = vec![0u8; 2 * HOST_PAGE_SIZE as usize];
        let whole = Buffer::from_ptr(storage.as_mut_ptr(), storage.len());
        let window = whole.slice(128, 512);

        let mut buffers = NamedBufferMap::new();
        buffers.insert("whole".to_string(), vec![whole]);
        buffers.insert("window".to_string(), vec![window]);

        let mut mapper = DeviceBufferMapper::new(Arc::clone(&space));
        mapper.map_inputs(&buffers).unwrap();
        assert_eq!(mapper.input_mappings.len(), 1);

        let whole_device = mapper.input_device_buffer("whole", 0).unwrap();
        let window_device = mapper.input_device_buffer("window", 0).unwrap();
        assert_eq!(
            window_device.device_address(),
            whole_device.device_address() + 128
        );
        mapper.unmap_all().unwrap();
        assert_eq!(mmu.num_mapped_pages(), 0);
    }

    #[test]
    fn unmap_all_is_idempotent() {
        let (space, _mmu) = make_space();
        let mut mapper = DeviceBufferMapper::new(space);
        mapper.unmap_all().unwrap();
        mapper.unmap_all().unwrap();
    }
}
