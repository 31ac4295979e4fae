//! The hardware-consumed instruction queue.
//!
//! A ring of 16-byte descriptors in host memory: the driver writes
//! descriptors and bumps the tail CSR; the device fetches them and
//! publishes progress by writing a 16-byte status block back to host
//! memory. Each enqueued descriptor carries a completion callback that
//! fires when the status block shows the entry consumed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axion_api::{Error, Result};
use log::trace;

use crate::chip::HibCsrOffsets;
use crate::device_buffer::MappedDeviceBuffer;
use crate::memory::host::HostAllocator;
use crate::memory::space::{AddressSpace, DmaDirection, MappingTypeHint};
use crate::registers::Registers;

/// One instruction-fetch descriptor (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostQueueDescriptor {
    /// Device address of the instruction chunk.
    pub address: u64,
    /// Chunk size in bytes.
    pub size_in_bytes: u32,
    /// Reserved, written as zero.
    pub reserved: u32,
}

const _: () = assert!(size_of::<HostQueueDescriptor>() == 16);

/// The status block the device writes back (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostQueueStatusBlock {
    /// Value of the completed head pointer when the block was updated.
    pub completed_head_pointer: u32,
    /// Non-zero when the queue hit a fatal error.
    pub fatal_error: u32,
    /// Reserved.
    pub reserved: u64,
}

const _: () = assert!(size_of::<HostQueueStatusBlock>() == 16);

/// Completion callback of one descriptor; receives the hardware error code
/// (0 on success).
pub type CompletionCallback = Box<dyn FnOnce(u32) + Send>;

struct HostQueueInner {
    open: bool,
    tail: u32,
    completed_head: u32,
    callbacks: VecDeque<CompletionCallback>,
    ring_mapping: Option<MappedDeviceBuffer>,
    status_mapping: Option<MappedDeviceBuffer>,
}

/// Driver side of the instruction queue.
pub struct HostQueue {
    size: u32,
    ring: axion_api::Buffer,
    status_block: axion_api::Buffer,
    registers: Arc<dyn Registers>,
    offsets: HibCsrOffsets,
    inner: Mutex<HostQueueInner>,
}

impl HostQueue {
    /// Allocates a queue of `size` descriptors (a power of two).
    pub fn new(
        size: u32,
        allocator: &HostAllocator,
        registers: Arc<dyn Registers>,
        offsets: HibCsrOffsets,
    ) -> Self {
        assert!(size.is_power_of_two(), "queue size must be a power of two");
        let ring = allocator.make_buffer(size as usize * size_of::<HostQueueDescriptor>());
        let status_block = allocator.make_buffer(size_of::<HostQueueStatusBlock>());
        Self {
            size,
            ring,
            status_block,
            registers,
            offsets,
            inner: Mutex::new(HostQueueInner {
                open: false,
                tail: 0,
                completed_head: 0,
                callbacks: VecDeque::new(),
                ring_mapping: None,
                status_mapping: None,
            }),
        }
    }

    /// Maps the queue memory for the device and programs the queue CSRs.
    pub fn open(&self, address_space: &Arc<dyn AddressSpace>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.open {
            return Err(Error::failed_precondition("host queue is already open"));
        }
        let ring_device = address_space.map(
            &self.ring,
            DmaDirection::Bidirectional,
            MappingTypeHint::Simple,
        )?;
        let status_device = match address_space.map(
            &self.status_block,
            DmaDirection::FromDevice,
            MappingTypeHint::Simple,
        ) {
            Ok(mapped) => mapped,
            Err(err) => {
                let _ = address_space.unmap(ring_device);
                return Err(err);
            }
        };

        self.registers
            .write_64(self.offsets.instruction_queue_base, ring_device.device_address())?;
        self.registers
            .write_64(self.offsets.instruction_queue_size, u64::from(self.size))?;
        self.registers.write_64(
            self.offsets.instruction_queue_status_block_base,
            status_device.device_address(),
        )?;
        self.registers
            .write_64(self.offsets.instruction_queue_tail, 0)?;

        inner.ring_mapping = Some(MappedDeviceBuffer::new(
            ring_device,
            Arc::clone(address_space),
        ));
        inner.status_mapping = Some(MappedDeviceBuffer::new(
            status_device,
            Arc::clone(address_space),
        ));
        inner.tail = 0;
        inner.completed_head = 0;
        inner.open = true;
        Ok(())
    }

    /// Unmaps and closes the queue. With `forced`, outstanding callbacks
    /// are dropped (their work was cancelled at the scheduler).
    pub fn close(&self, forced: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(Error::failed_precondition("host queue is not open"));
        }
        if !inner.callbacks.is_empty() && !forced {
            return Err(Error::failed_precondition(format!(
                "host queue closed with {} descriptors outstanding",
                inner.callbacks.len()
            )));
        }
        inner.callbacks.clear();
        let mut status = Ok(());
        if let Some(mapping) = inner.ring_mapping.take() {
            axion_api::error::accumulate(&mut status, mapping.unmap());
        }
        if let Some(mapping) = inner.status_mapping.take() {
            axion_api::error::accumulate(&mut status, mapping.unmap());
        }
        inner.open = false;
        status
    }

    /// Unmasks the queue-consumed interrupt.
    pub fn enable_interrupts(&self) -> Result<()> {
        self.registers
            .write_64(self.offsets.instruction_queue_int_control, 1)
    }

    /// Masks the queue-consumed interrupt.
    pub fn disable_interrupts(&self) -> Result<()> {
        self.registers
            .write_64(self.offsets.instruction_queue_int_control, 0)
    }

    /// Free descriptor slots. One slot stays unused to distinguish full
    /// from empty.
    pub fn available_space(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        if !inner.open {
            return 0;
        }
        self.size - 1 - inner.tail.wrapping_sub(inner.completed_head) % self.size
    }

    /// Writes `descriptor` into the ring and bumps the tail CSR. `callback`
    /// fires when the device consumes the entry.
    pub fn enqueue(
        &self,
        descriptor: HostQueueDescriptor,
        callback: CompletionCallback,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(Error::failed_precondition("host queue is not open"));
        }
        if self.size - 1 - inner.tail.wrapping_sub(inner.completed_head) % self.size == 0 {
            return Err(Error::unavailable("host queue is full"));
        }
        let slot = (inner.tail % self.size) as usize;
        // SAFETY: the ring buffer holds `size` descriptors; slot < size.
        // Volatile because the device reads this memory concurrently.
        unsafe {
            let base = self.ring.ptr().cast::<HostQueueDescriptor>();
            base.add(slot).write_volatile(descriptor);
        }
        inner.tail = inner.tail.wrapping_add(1);
        inner.callbacks.push_back(callback);
        trace!(
            "enqueued descriptor at slot {slot} (0x{:016x}, {} bytes)",
            descriptor.address, descriptor.size_in_bytes
        );
        self.registers
            .write_64(self.offsets.instruction_queue_tail, u64::from(inner.tail))
    }

    /// Reads the status block and fires callbacks for every newly consumed
    /// entry. Called from the queue interrupt.
    pub fn process_status_block(&self) {
        let mut fired: Vec<(CompletionCallback, u32)> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.open {
                return;
            }
            // SAFETY: the status block is a live 16-byte allocation the
            // device writes; volatile read snapshots it.
            let status = unsafe {
                self.status_block
                    .ptr()
                    .cast::<HostQueueStatusBlock>()
                    .read_volatile()
            };
            let error_code = status.fatal_error;
            while inner.completed_head != status.completed_head_pointer {
                let Some(callback) = inner.callbacks.pop_front() else {
                    break;
                };
                fired.push((callback, error_code));
                inner.completed_head = inner.completed_head.wrapping_add(1);
            }
        }
        // Callbacks run unlocked; they re-enter the queue to issue more
        // work.
        for (callback, error_code) in fired {
            callback(error_code);
        }
    }

    /// Host memory of the descriptor ring, for the device side of the
    /// contract (hardware models, diagnostics).
    pub fn ring_memory(&self) -> axion_api::Buffer {
        self.ring.clone()
    }

    /// Host memory of the status block, for the device side of the
    /// contract.
    pub fn status_block_memory(&self) -> axion_api::Buffer {
        self.status_block.clone()
    }
}
