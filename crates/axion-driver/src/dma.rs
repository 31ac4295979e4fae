//! DMA descriptors, hint extraction and transfer chunking.

use axion_api::{Error, Result};
use axion_pack::{DmaHint, DmaHintTarget, Executable, FeedDirection};
use log::trace;

use crate::device_buffer::DeviceBuffer;
use crate::mapper::DeviceBufferMapper;
use crate::memory::util;

/// What one DMA descriptor moves or marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaKind {
    /// Instruction bitstream chunk, host to device.
    Instruction,
    /// Input activations, host to device.
    InputActivation,
    /// Parameters, host to device.
    Parameter,
    /// Output activations, device to host.
    OutputActivation,
    /// Scalar-core-to-host interrupt 0 (sub-request completion).
    ScalarCoreInterrupt0,
    /// Scalar-core-to-host interrupt 1.
    ScalarCoreInterrupt1,
    /// Scalar-core-to-host interrupt 2.
    ScalarCoreInterrupt2,
    /// Scalar-core-to-host interrupt 3.
    ScalarCoreInterrupt3,
    /// Fence over earlier DMAs of the same sub-request. Never issued to
    /// hardware.
    LocalFence,
    /// Fence over all earlier DMAs across sub-requests.
    GlobalFence,
}

impl DmaKind {
    /// The scalar-core interrupt kind for ids 0..=3.
    pub fn scalar_core_interrupt(id: u32) -> Self {
        match id {
            0 => Self::ScalarCoreInterrupt0,
            1 => Self::ScalarCoreInterrupt1,
            2 => Self::ScalarCoreInterrupt2,
            3 => Self::ScalarCoreInterrupt3,
            _ => panic!("scalar-core interrupt id {id} out of range"),
        }
    }

    /// True for the fence kinds.
    pub fn is_fence(&self) -> bool {
        matches!(self, Self::LocalFence | Self::GlobalFence)
    }

    /// True for kinds that carry data over the wire.
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            Self::Instruction
                | Self::InputActivation
                | Self::Parameter
                | Self::OutputActivation
        )
    }
}

/// Lifecycle of one DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaState {
    /// Not yet handed to the transport.
    Pending,
    /// In flight.
    Active,
    /// Finished.
    Completed,
    /// Failed.
    Error,
}

/// One DMA of a sub-request's plan.
#[derive(Debug, Clone)]
pub struct DmaInfo {
    id: i32,
    kind: DmaKind,
    buffer: DeviceBuffer,
    state: DmaState,
}

impl DmaInfo {
    /// Creates a descriptor without a buffer (interrupts, fences).
    pub fn marker(id: i32, kind: DmaKind) -> Self {
        Self {
            id,
            kind,
            buffer: DeviceBuffer::invalid(),
            state: DmaState::Pending,
        }
    }

    /// Creates a transfer descriptor over `buffer`.
    pub fn transfer(id: i32, kind: DmaKind, buffer: DeviceBuffer) -> Self {
        Self {
            id,
            kind,
            buffer,
            state: DmaState::Pending,
        }
    }

    /// Descriptor id, unique within its sub-request.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// What the descriptor moves or marks.
    pub fn kind(&self) -> DmaKind {
        self.kind
    }

    /// The device-side buffer; invalid for markers.
    pub fn buffer(&self) -> DeviceBuffer {
        self.buffer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DmaState {
        self.state
    }

    /// True while in flight.
    pub fn is_active(&self) -> bool {
        self.state == DmaState::Active
    }

    /// True once finished.
    pub fn is_completed(&self) -> bool {
        self.state == DmaState::Completed
    }

    /// Marks the descriptor in flight.
    pub fn mark_active(&mut self) {
        self.state = DmaState::Active;
    }

    /// Marks the descriptor finished.
    pub fn mark_completed(&mut self) {
        self.state = DmaState::Completed;
    }
}

/// How the DMA plan of a sub-request is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorMode {
    /// Instruction chunks only; the device fetches everything else itself.
    InstructionDma,
    /// Replay the executable's full hint list.
    DmaHints,
    /// First instruction chunk only (minimal bring-up mode).
    FirstInstruction,
}

/// Builds the ordered DMA plan of one sub-request.
#[derive(Debug, Clone, Copy)]
pub struct DmaInfoExtractor {
    mode: ExtractorMode,
    overlap_requests: bool,
}

impl DmaInfoExtractor {
    /// Creates an extractor. With `overlap_requests` the terminal global
    /// fence is omitted where the hints are trustworthy, letting the next
    /// sub-request's transfers start early.
    pub fn new(mode: ExtractorMode, overlap_requests: bool) -> Self {
        Self {
            mode,
            overlap_requests,
        }
    }

    /// Extracts the DMA plan for `executable` with the buffers bound in
    /// `mapper`.
    pub fn extract(
        &self,
        executable: &Executable,
        parameter_buffer: DeviceBuffer,
        mapper: &DeviceBufferMapper,
    ) -> Result<Vec<DmaInfo>> {
        match self.mode {
            ExtractorMode::InstructionDma => Ok(self.extract_instruction_dmas(mapper)),
            ExtractorMode::DmaHints => self.extract_dma_hints(executable, parameter_buffer, mapper),
            ExtractorMode::FirstInstruction => Self::extract_first_instruction(mapper),
        }
    }

    fn extract_instruction_dmas(&self, mapper: &DeviceBufferMapper) -> Vec<DmaInfo> {
        let mut dmas = Vec::new();
        let mut id = 0;
        for buffer in mapper.instruction_device_buffers() {
            dmas.push(DmaInfo::transfer(id, DmaKind::Instruction, *buffer));
            id += 1;
        }
        if !self.overlap_requests {
            dmas.push(DmaInfo::marker(id, DmaKind::GlobalFence));
        }
        dmas
    }

    fn extract_dma_hints(
        &self,
        executable: &Executable,
        parameter_buffer: DeviceBuffer,
        mapper: &DeviceBufferMapper,
    ) -> Result<Vec<DmaInfo>> {
        let mut dmas = Vec::new();
        let mut id = 0;
        for hint in &executable.dma_hints {
            match hint {
                DmaHint::Descriptor {
                    target,
                    direction,
                    name,
                    batch,
                    offset,
                    size,
                } => {
                    let (kind, buffer) = match target {
                        DmaHintTarget::InputActivation => {
                            let buffer = mapper.input_device_buffer(name, *batch as usize)?;
                            // Inputs may be unpadded; the DMA may read a
                            // little past the buffer end but must not cross
                            // into the next page.
                            let last_page_of_buffer = util::page_address(
                                buffer.device_address() + buffer.size_bytes() as u64 - 1,
                            );
                            let last_page_of_dma =
                                util::page_address(buffer.device_address() + offset + size - 1);
                            if last_page_of_dma > last_page_of_buffer {
                                return Err(Error::failed_precondition(format!(
                                    "input DMA hint for \"{name}\" overflows past the \
                                     buffer's final page"
                                )));
                            }
                            (
                                DmaKind::InputActivation,
                                buffer.slice(*offset, *size as usize, true),
                            )
                        }
                        DmaHintTarget::OutputActivation => {
                            let buffer = mapper.output_device_buffer(name, *batch as usize)?;
                            (
                                DmaKind::OutputActivation,
                                buffer.slice(*offset, *size as usize, false),
                            )
                        }
                        DmaHintTarget::Parameter => (
                            DmaKind::Parameter,
                            parameter_buffer.slice(*offset, *size as usize, false),
                        ),
                        DmaHintTarget::Scratch => {
                            let kind = match direction {
                                FeedDirection::Infeed => DmaKind::InputActivation,
                                FeedDirection::Outfeed => DmaKind::OutputActivation,
                            };
                            (
                                kind,
                                mapper
                                    .scratch_device_buffer()
                                    .slice(*offset, *size as usize, false),
                            )
                        }
                    };
                    dmas.push(DmaInfo::transfer(id, kind, buffer));
                }
                DmaHint::Instruction { chunk_index } => {
                    let buffer = mapper.instruction_device_buffer(*chunk_index as usize)?;
                    dmas.push(DmaInfo::transfer(id, DmaKind::Instruction, buffer));
                }
                DmaHint::Interrupt { id: interrupt } => {
                    dmas.push(DmaInfo::marker(
                        id,
                        DmaKind::scalar_core_interrupt(*interrupt),
                    ));
                }
                DmaHint::LocalFence => {
                    dmas.push(DmaInfo::marker(id, DmaKind::LocalFence));
                }
            }
            id += 1;
        }

        // Enforce ordering against the next sub-request unless the hints
        // are complete and overlap is allowed.
        if !executable.fully_deterministic || !self.overlap_requests {
            dmas.push(DmaInfo::marker(id, DmaKind::GlobalFence));
        }

        for dma in &dmas {
            trace!("extracted {dma:?}");
        }
        Ok(dmas)
    }

    fn extract_first_instruction(mapper: &DeviceBufferMapper) -> Result<Vec<DmaInfo>> {
        let first = mapper.instruction_device_buffer(0)?;
        Ok(vec![
            DmaInfo::transfer(0, DmaKind::Instruction, first),
            DmaInfo::marker(1, DmaKind::GlobalFence),
        ])
    }
}

/// How chunked DMA is consumed by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareProcessing {
    /// Every handed-out chunk is processed in full.
    Committed,
    /// Chunks may be partially consumed; unacknowledged bytes re-chunk.
    BestEffort,
}

/// Splits one DMA into transfer-sized chunks, tracking acknowledgement.
#[derive(Debug, Clone)]
pub struct DmaChunker {
    processing: HardwareProcessing,
    buffer: DeviceBuffer,
    active_bytes: usize,
    transferred_bytes: usize,
}

impl DmaChunker {
    /// Chunks `buffer` under the given processing discipline.
    pub fn new(processing: HardwareProcessing, buffer: DeviceBuffer) -> Self {
        Self {
            processing,
            buffer,
            active_bytes: 0,
            transferred_bytes: 0,
        }
    }

    /// True while un-handed-out bytes remain.
    pub fn has_next_chunk(&self) -> bool {
        self.next_chunk_offset() < self.buffer.size_bytes()
    }

    /// Hands out everything that remains.
    pub fn next_chunk(&mut self) -> DeviceBuffer {
        let offset = self.next_chunk_offset();
        let remaining = self.buffer.size_bytes() - offset;
        self.mark_active(remaining);
        self.buffer.slice(offset as u64, remaining, false)
    }

    /// Hands out at most `num_bytes`.
    pub fn next_chunk_limited(&mut self, num_bytes: usize) -> DeviceBuffer {
        let offset = self.next_chunk_offset();
        let remaining = self.buffer.size_bytes() - offset;
        let transfer = remaining.min(num_bytes);
        self.mark_active(transfer);
        self.buffer.slice(offset as u64, transfer, false)
    }

    /// Records `transferred_bytes` as acknowledged by the hardware.
    pub fn notify_transfer(&mut self, transferred_bytes: usize) {
        self.transferred_bytes += transferred_bytes;
        assert!(
            self.active_bytes >= transferred_bytes || self.processing == HardwareProcessing::BestEffort,
            "acknowledged more bytes than were active"
        );
        match self.processing {
            HardwareProcessing::Committed => self.active_bytes -= transferred_bytes,
            // Active bytes may be partially dropped by the hardware;
            // re-chunk whatever was not acknowledged.
            HardwareProcessing::BestEffort => self.active_bytes = 0,
        }
        assert!(self.transferred_bytes <= self.buffer.size_bytes());
    }

    /// True while handed-out bytes await acknowledgement.
    pub fn is_active(&self) -> bool {
        self.active_bytes > 0
    }

    /// True once every byte is acknowledged.
    pub fn is_completed(&self) -> bool {
        self.transferred_bytes == self.buffer.size_bytes()
    }

    /// The whole underlying buffer.
    pub fn buffer(&self) -> DeviceBuffer {
        self.buffer
    }

    /// Number of outstanding transfers, assuming each covers `bytes`.
    pub fn active_count(&self, bytes: usize) -> usize {
        self.active_bytes.div_ceil(bytes)
    }

    fn next_chunk_offset(&self) -> usize {
        match self.processing {
            HardwareProcessing::Committed => self.transferred_bytes + self.active_bytes,
            HardwareProcessing::BestEffort => self.transferred_bytes,
        }
    }

    fn mark_active(&mut self, num_bytes: usize) {
        match self.processing {
            HardwareProcessing::Committed => self.active_bytes += num_bytes,
            HardwareProcessing::BestEffort => self.active_bytes = num_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::DeviceBufferMapper;
    use crate::memory::nop::NopAddressSpace;
    use axion_api::Buffer;
    use axion_api::buffer::NamedBufferMap;
    use axion_pack::{DmaHint as Hint, ExecutableBuilder, ExecutableKind, LayerBuilder, parse_package};
    use std::sync::Arc;

    fn executable_with_hints(fully_deterministic: bool) -> Executable {
        let bytes = axion_pack::PackageBuilder::new("m", axion_pack::Chip::A1)
            .executable(
                ExecutableBuilder::new(ExecutableKind::Standalone, 1)
                    .input_layer(LayerBuilder::new("in", axion_pack::DataType::FixedPoint8, 1, 1, 64))
                    .output_layer(LayerBuilder::new("out", axion_pack::DataType::FixedPoint8, 1, 1, 64))
                    .instruction_chunk(vec![0u8; 32], Vec::new())
                    .fully_deterministic(fully_deterministic)
                    .dma_hint(Hint::Instruction { chunk_index: 0 })
                    .dma_hint(Hint::Descriptor {
                        target: DmaHintTarget::InputActivation,
                        direction: FeedDirection::Infeed,
                        name: "in".to_string(),
                        batch: 0,
                        offset: 0,
                        size: 64,
                    })
                    .dma_hint(Hint::LocalFence)
                    .dma_hint(Hint::Descriptor {
                        target: DmaHintTarget::OutputActivation,
                        direction: FeedDirection::Outfeed,
                        name: "out".to_string(),
                        batch: 0,
                        offset: 0,
                        size: 64,
                    })
                    .dma_hint(Hint::Interrupt { id: 0 }),
            )
            .build();
        parse_package(&bytes).unwrap().executables.remove(0)
    }

    fn mapper_with_io() -> (DeviceBufferMapper, Vec<Buffer>) {
        let space: Arc<dyn crate::memory::space::AddressSpace> =
            Arc::new(NopAddressSpace::new());
        let mut mapper = DeviceBufferMapper::new(space);
        let allocator = crate::memory::host::HostAllocator::new(4096);
        let input = allocator.make_buffer(64);
        let output = allocator.make_buffer(64);
        let instructions = allocator.make_buffer(32);

        let mut inputs = NamedBufferMap::new();
        inputs.insert("in".to_string(), vec![input.clone()]);
        mapper.map_inputs(&inputs).unwrap();
        let mut outputs = NamedBufferMap::new();
        outputs.insert("out".to_string(), vec![output.clone()]);
        mapper.map_outputs(&outputs).unwrap();
        mapper.map_instructions(&[instructions.clone()]).unwrap();
        (mapper, vec![input, output, instructions])
    }

    #[test]
    fn hint_extraction_preserves_order_and_kinds() {
        let executable = executable_with_hints(true);
        let (mapper, _keep_alive) = mapper_with_io();
        let extractor = DmaInfoExtractor::new(ExtractorMode::DmaHints, true);
        let dmas = extractor
            .extract(&executable, DeviceBuffer::invalid(), &mapper)
            .unwrap();
        let kinds: Vec<DmaKind> = dmas.iter().map(DmaInfo::kind).collect();
        // Fully deterministic with overlap allowed: no trailing fence.
        assert_eq!(
            kinds,
            vec![
                DmaKind::Instruction,
                DmaKind::InputActivation,
                DmaKind::LocalFence,
                DmaKind::OutputActivation,
                DmaKind::ScalarCoreInterrupt0,
            ]
        );
    }

    #[test]
    fn non_deterministic_hints_get_a_terminal_global_fence() {
        let executable = executable_with_hints(false);
        let (mapper, _keep_alive) = mapper_with_io();
        let extractor = DmaInfoExtractor::new(ExtractorMode::DmaHints, true);
        let dmas = extractor
            .extract(&executable, DeviceBuffer::invalid(), &mapper)
            .unwrap();
        assert_eq!(dmas.last().unwrap().kind(), DmaKind::GlobalFence);
    }

    #[test]
    fn overlap_disabled_appends_the_fence_for_instruction_mode() {
        let (mapper, _keep_alive) = mapper_with_io();
        let fenced = DmaInfoExtractor::new(ExtractorMode::InstructionDma, false);
        let executable = executable_with_hints(true);
        let dmas = fenced
            .extract(&executable, DeviceBuffer::invalid(), &mapper)
            .unwrap();
        assert_eq!(dmas.last().unwrap().kind(), DmaKind::GlobalFence);

        let overlapped = DmaInfoExtractor::new(ExtractorMode::InstructionDma, true);
        let dmas = overlapped
            .extract(&executable, DeviceBuffer::invalid(), &mapper)
            .unwrap();
        assert!(dmas.iter().all(|dma| dma.kind() == DmaKind::Instruction));
    }

    #[test]
    fn committed_chunker_advances_past_active_bytes() {
        let mut chunker = DmaChunker::new(
            HardwareProcessing::Committed,
            DeviceBuffer::new(0x1000, 1000),
        );
        let first = chunker.next_chunk_limited(256);
        assert_eq!(first.device_address(), 0x1000);
        assert_eq!(first.size_bytes(), 256);
        let second = chunker.next_chunk_limited(256);
        assert_eq!(second.device_address(), 0x1100);
        assert!(chunker.is_active());
        assert!(!chunker.is_completed());

        chunker.notify_transfer(256);
        chunker.notify_transfer(256);
        let rest = chunker.next_chunk();
        assert_eq!(rest.size_bytes(), 1000 - 512);
        chunker.notify_transfer(1000 - 512);
        assert!(chunker.is_completed());
        assert!(!chunker.has_next_chunk());
    }

    #[test]
    fn best_effort_rechunks_unacknowledged_bytes() {
        let mut chunker = DmaChunker::new(
            HardwareProcessing::BestEffort,
            DeviceBuffer::new(0x2000, 512),
        );
        let first = chunker.next_chunk();
        assert_eq!(first.size_bytes(), 512);
        // Hardware only took half.
        chunker.notify_transfer(256);
        let retry = chunker.next_chunk();
        assert_eq!(retry.device_address(), 0x2100);
        assert_eq!(retry.size_bytes(), 256);
        chunker.notify_transfer(256);
        assert!(chunker.is_completed());
    }

    #[test]
    fn active_count_rounds_up() {
        let mut chunker = DmaChunker::new(
            HardwareProcessing::Committed,
            DeviceBuffer::new(0, 1000),
        );
        chunker.next_chunk_limited(700);
        assert_eq!(chunker.active_count(256), 3);
    }
}
