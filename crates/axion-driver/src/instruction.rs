//! Instruction buffer copies and address patching.
//!
//! Every sub-request runs a private, patched copy of the executable's
//! instruction bitstream: resolved device addresses for scratch, parameters
//! and per-batch activations are written into the copy at the compiler's
//! patch points before it is mapped for DMA.

use axion_api::Buffer;
use axion_pack::{FieldOffsetKind, InstructionChunk};
use log::trace;

use crate::device_buffer::DeviceBuffer;
use crate::mapper::DeviceBufferMapper;
use crate::memory::host::HostAllocator;

/// Writes the low 32 bits of `value` into `buffer` starting at `bit_offset`,
/// little-endian bit order.
///
/// Patch points are usually byte aligned; the bit loop covers packed
/// instruction words that are not.
pub fn write_u32_at_bit(buffer: &mut [u8], bit_offset: usize, value: u32) {
    if bit_offset % 8 == 0 {
        let byte = bit_offset / 8;
        buffer[byte..byte + 4].copy_from_slice(&value.to_le_bytes());
        return;
    }
    for bit in 0..32 {
        let target = bit_offset + bit;
        let mask = 1u8 << (target % 8);
        if (value >> bit) & 1 == 1 {
            buffer[target / 8] |= mask;
        } else {
            buffer[target / 8] &= !mask;
        }
    }
}

/// Reads 32 bits at `bit_offset`, the inverse of [`write_u32_at_bit`].
pub fn read_u32_at_bit(buffer: &[u8], bit_offset: usize) -> u32 {
    if bit_offset % 8 == 0 {
        let byte = bit_offset / 8;
        return u32::from_le_bytes(buffer[byte..byte + 4].try_into().unwrap());
    }
    let mut value = 0u32;
    for bit in 0..32 {
        let target = bit_offset + bit;
        if buffer[target / 8] & (1 << (target % 8)) != 0 {
            value |= 1 << bit;
        }
    }
    value
}

/// Aligned, patchable copies of an executable's instruction chunks.
///
/// Instances cycle through a bounded per-executable pool: patching
/// overwrites the previous request's addresses, so a pooled copy needs no
/// re-initialisation.
#[derive(Debug)]
pub struct InstructionBuffers {
    buffers: Vec<Buffer>,
}

impl InstructionBuffers {
    /// Allocates aligned copies of `chunks`.
    pub fn new(allocator: &HostAllocator, chunks: &[InstructionChunk]) -> Self {
        let mut buffers = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let buffer = allocator.make_buffer(chunk.bitstream.len());
            // SAFETY: freshly allocated buffer of exactly bitstream.len().
            unsafe {
                std::ptr::copy_nonoverlapping(
                    chunk.bitstream.as_ptr(),
                    buffer.ptr(),
                    chunk.bitstream.len(),
                );
            }
            buffers.push(buffer);
        }
        trace!("instruction buffers created ({} chunks)", buffers.len());
        Self { buffers }
    }

    /// The chunk copies, in chunk order.
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// Patches every chunk with the resolved device addresses of the
    /// sub-request: scratch, parameters, and per-batch input/output
    /// activations.
    pub fn link(
        &mut self,
        parameter_buffer: DeviceBuffer,
        mapper: &DeviceBufferMapper,
        chunks: &[InstructionChunk],
    ) {
        let scratch = mapper.scratch_device_buffer();
        for (chunk, buffer) in chunks.iter().zip(self.buffers.iter_mut()) {
            // SAFETY: the buffer is an exclusive aligned copy sized to the
            // chunk, created in new().
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(buffer.ptr(), buffer.size_bytes())
            };
            for offset in &chunk.field_offsets {
                let address = match offset.kind {
                    FieldOffsetKind::Scratch => {
                        if !scratch.is_valid() {
                            continue;
                        }
                        scratch.device_address()
                    }
                    FieldOffsetKind::Parameter => {
                        if !parameter_buffer.is_valid() {
                            continue;
                        }
                        parameter_buffer.device_address()
                    }
                    FieldOffsetKind::Input => {
                        match mapper.input_device_buffer(&offset.name, offset.batch as usize) {
                            Ok(buffer) => buffer.device_address(),
                            Err(_) => continue,
                        }
                    }
                    FieldOffsetKind::Output => {
                        match mapper.output_device_buffer(&offset.name, offset.batch as usize) {
                            Ok(buffer) => buffer.device_address(),
                            Err(_) => continue,
                        }
                    }
                };
                write_u32_at_bit(bytes, offset.bit_offset as usize, address as u32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_aligned_write_round_trips() {
        let mut buffer = vec![0u8; 16];
        write_u32_at_bit(&mut buffer, 32, 0xDEAD_BEEF);
        assert_eq!(read_u32_at_bit(&buffer, 32), 0xDEAD_BEEF);
        assert_eq!(&buffer[4..8], &0xDEAD_BEEFu32.to_le_bytes());
    }

    #[test]
    fn unaligned_write_round_trips() {
        let mut buffer = vec![0xFFu8; 16];
        write_u32_at_bit(&mut buffer, 13, 0x1234_5678);
        assert_eq!(read_u32_at_bit(&buffer, 13), 0x1234_5678);
        // Bits outside the window are untouched.
        assert_eq!(buffer[0], 0xFF);
        assert_eq!(buffer[1] & 0x1F, 0x1F);
    }

    #[test]
    fn copies_match_chunk_contents() {
        let allocator = HostAllocator::new(64);
        let chunks = vec![InstructionChunk {
            bitstream: vec![0xAB; 32],
            field_offsets: Vec::new(),
        }];
        let buffers = InstructionBuffers::new(&allocator, &chunks);
        assert_eq!(buffers.buffers().len(), 1);
        // SAFETY: buffer is a live 32-byte allocation.
        let copy = unsafe {
            std::slice::from_raw_parts(buffers.buffers()[0].ptr(), 32)
        };
        assert_eq!(copy, &chunks[0].bitstream[..]);
    }
}
