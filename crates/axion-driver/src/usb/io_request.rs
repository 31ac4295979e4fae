//! In-flight USB I/O bookkeeping.
//!
//! Each entry in the transport's FIFO represents one wire obligation: a
//! chunked bulk-out, a chunked bulk-in, or a scalar-core interrupt that
//! completes by matching a device event. Entries originate from the
//! scheduler's DMA plan (hints) or from descriptors the device pushes at
//! runtime; when both sources are live, descriptors validate hints in FIFO
//! order.

use crate::device_buffer::DeviceBuffer;
use crate::dma::{DmaChunker, DmaKind, HardwareProcessing};
use crate::scheduler::{DmaToken, IssuedDma};
use crate::usb::device::DescriptorTag;

/// Wire class of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    /// Host-to-device data.
    BulkOut,
    /// Device-to-host data.
    BulkIn,
    /// Scalar-core-to-host interrupt; no wire transfer.
    ScHostInterrupt,
}

/// Where an entry came from and whether it has been matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceAndMatchStatus {
    /// Pushed by a device descriptor; nothing to match.
    SubmittedByDevice,
    /// Pushed from a DMA hint, not yet confirmed by the device.
    HintNotYetMatched,
    /// Pushed from a DMA hint and confirmed.
    HintAlreadyMatched,
}

/// One entry of the transport's I/O FIFO.
pub struct UsbIoRequest {
    io_id: i64,
    dma_id: i32,
    ty: IoType,
    tag: DescriptorTag,
    source_and_match: SourceAndMatchStatus,
    token: Option<DmaToken>,
    chunker: Option<DmaChunker>,
    matched: bool,
    header_sent: bool,
    /// Boxed so the bytes stay put while the entry moves inside the FIFO;
    /// an async transfer points at them.
    header: Option<Box<[u8; 8]>>,
}

impl UsbIoRequest {
    /// Builds an entry from a scheduler-issued DMA.
    pub fn from_dma(io_id: i64, dma: &IssuedDma) -> Self {
        let (ty, tag, chunker) = match dma.kind {
            DmaKind::Instruction => (
                IoType::BulkOut,
                DescriptorTag::Instructions,
                // Bulk-out chunks are always consumed in full.
                Some(DmaChunker::new(HardwareProcessing::Committed, dma.buffer)),
            ),
            DmaKind::InputActivation => (
                IoType::BulkOut,
                DescriptorTag::InputActivations,
                Some(DmaChunker::new(HardwareProcessing::Committed, dma.buffer)),
            ),
            DmaKind::Parameter => (
                IoType::BulkOut,
                DescriptorTag::Parameters,
                Some(DmaChunker::new(HardwareProcessing::Committed, dma.buffer)),
            ),
            DmaKind::OutputActivation => (
                IoType::BulkIn,
                DescriptorTag::OutputActivations,
                // The device fills bulk-ins best-effort; unacknowledged
                // bytes re-chunk.
                Some(DmaChunker::new(HardwareProcessing::BestEffort, dma.buffer)),
            ),
            DmaKind::ScalarCoreInterrupt0 => {
                (IoType::ScHostInterrupt, DescriptorTag::Interrupt(0), None)
            }
            DmaKind::ScalarCoreInterrupt1 => {
                (IoType::ScHostInterrupt, DescriptorTag::Interrupt(1), None)
            }
            DmaKind::ScalarCoreInterrupt2 => {
                (IoType::ScHostInterrupt, DescriptorTag::Interrupt(2), None)
            }
            DmaKind::ScalarCoreInterrupt3 => {
                (IoType::ScHostInterrupt, DescriptorTag::Interrupt(3), None)
            }
            DmaKind::LocalFence | DmaKind::GlobalFence => {
                unreachable!("fences are resolved inside the scheduler")
            }
        };
        Self {
            io_id,
            dma_id: dma.id,
            ty,
            tag,
            source_and_match: SourceAndMatchStatus::HintNotYetMatched,
            token: Some(dma.token),
            chunker,
            matched: false,
            header_sent: false,
            header: None,
        }
    }

    /// Builds a data entry from a device descriptor.
    pub fn from_device(io_id: i64, ty: IoType, tag: DescriptorTag, buffer: DeviceBuffer) -> Self {
        let processing = if ty == IoType::BulkIn {
            HardwareProcessing::BestEffort
        } else {
            HardwareProcessing::Committed
        };
        Self {
            io_id,
            dma_id: -1,
            ty,
            tag,
            source_and_match: SourceAndMatchStatus::SubmittedByDevice,
            token: None,
            chunker: Some(DmaChunker::new(processing, buffer)),
            matched: false,
            header_sent: false,
            header: None,
        }
    }

    /// Builds an interrupt entry from a device descriptor.
    pub fn interrupt_from_device(io_id: i64, tag: DescriptorTag) -> Self {
        Self {
            io_id,
            dma_id: -1,
            ty: IoType::ScHostInterrupt,
            tag,
            source_and_match: SourceAndMatchStatus::SubmittedByDevice,
            token: None,
            chunker: None,
            // Device-originated interrupts have already happened.
            matched: true,
            header_sent: false,
            header: None,
        }
    }

    /// Transport-unique id used to correlate async completions.
    pub fn io_id(&self) -> i64 {
        self.io_id
    }

    /// DMA descriptor id, for logging; -1 for device-originated entries.
    pub fn dma_id(&self) -> i32 {
        self.dma_id
    }

    /// Wire class.
    pub fn ty(&self) -> IoType {
        self.ty
    }

    /// Transfer tag.
    pub fn tag(&self) -> DescriptorTag {
        self.tag
    }

    /// Provenance and matching state.
    pub fn source_and_match_status(&self) -> SourceAndMatchStatus {
        self.source_and_match
    }

    /// True when the entry came from a DMA hint.
    pub fn from_dma_hint(&self) -> bool {
        self.token.is_some()
    }

    /// Scheduler token of hint-originated entries.
    pub fn token(&self) -> Option<DmaToken> {
        self.token
    }

    /// Marks a hint entry as confirmed by a device descriptor. Completes
    /// interrupt entries.
    pub fn set_matched(&mut self) {
        self.matched = true;
        if self.source_and_match == SourceAndMatchStatus::HintNotYetMatched {
            self.source_and_match = SourceAndMatchStatus::HintAlreadyMatched;
        }
    }

    /// The whole transfer window.
    pub fn buffer(&self) -> DeviceBuffer {
        self.chunker
            .as_ref()
            .map_or_else(DeviceBuffer::invalid, DmaChunker::buffer)
    }

    /// True when the entry's obligation is fulfilled.
    pub fn is_completed(&self) -> bool {
        match self.ty {
            IoType::ScHostInterrupt => self.matched,
            _ => self
                .chunker
                .as_ref()
                .is_some_and(DmaChunker::is_completed),
        }
    }

    /// True while handed-out bytes await acknowledgement.
    pub fn is_active(&self) -> bool {
        self.chunker.as_ref().is_some_and(DmaChunker::is_active)
    }

    /// True while un-handed-out bytes remain.
    pub fn has_next_chunk(&self) -> bool {
        self.chunker.as_ref().is_some_and(DmaChunker::has_next_chunk)
    }

    /// Hands out everything that remains.
    pub fn next_chunk(&mut self) -> DeviceBuffer {
        self.chunker.as_mut().expect("transfer entry").next_chunk()
    }

    /// Hands out at most `num_bytes`.
    pub fn next_chunk_limited(&mut self, num_bytes: usize) -> DeviceBuffer {
        self.chunker
            .as_mut()
            .expect("transfer entry")
            .next_chunk_limited(num_bytes)
    }

    /// Acknowledges `bytes` transferred on the wire.
    pub fn notify_transfer(&mut self, bytes: usize) {
        if let Some(chunker) = self.chunker.as_mut() {
            chunker.notify_transfer(bytes);
        }
    }

    /// Outstanding transfer count assuming `bytes` per transfer.
    pub fn active_count(&self, bytes: usize) -> usize {
        self.chunker
            .as_ref()
            .map_or(0, |chunker| chunker.active_count(bytes))
    }

    /// True once the single-EP header went on the wire.
    pub fn is_header_sent(&self) -> bool {
        self.header_sent
    }

    /// Stores the single-EP header and marks it sent. Returns a pointer
    /// valid until the entry drops.
    pub fn set_header(&mut self, header: [u8; 8]) -> *const u8 {
        self.header = Some(Box::new(header));
        self.header_sent = true;
        self.header.as_ref().unwrap().as_ptr()
    }
}
