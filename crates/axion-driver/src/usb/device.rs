//! The USB device contract.
//!
//! The runtime drives the device through this trait; the platform supplies
//! an implementation over its USB stack, and tests supply a software
//! device model. Completion callbacks run on the USB stack's completion
//! thread and must hand work to the transport's worker without blocking.

use axion_api::Result;

// -- Endpoints -----------------------------------------------------------------

/// Bulk-out endpoint for instructions (also the single-EP data endpoint).
pub const INSTRUCTIONS_ENDPOINT: u8 = 1;
/// Bulk-out endpoint for input activations (multi-EP modes).
pub const INPUT_ACTIVATIONS_ENDPOINT: u8 = 2;
/// Bulk-out endpoint for parameters (multi-EP modes).
pub const PARAMETERS_ENDPOINT: u8 = 3;
/// The single bulk-out endpoint in single-EP mode.
pub const SINGLE_BULK_OUT_ENDPOINT: u8 = INSTRUCTIONS_ENDPOINT;
/// Bulk-in endpoint for output activations.
pub const BULK_IN_ENDPOINT: u8 = 0x81;
/// Event endpoint delivering DMA descriptors.
pub const EVENT_IN_ENDPOINT: u8 = 0x82;
/// Interrupt endpoint for error and top-level lines.
pub const INTERRUPT_IN_ENDPOINT: u8 = 0x83;

// -- Descriptors ---------------------------------------------------------------

/// Transfer class tag, shared between DMA descriptors and single-EP
/// headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorTag {
    /// Instruction bitstream bytes.
    Instructions,
    /// Input activation bytes.
    InputActivations,
    /// Parameter bytes.
    Parameters,
    /// Output activation bytes.
    OutputActivations,
    /// Scalar-core-to-host interrupt 0..=3.
    Interrupt(u32),
}

impl DescriptorTag {
    /// Decodes the wire value.
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Instructions),
            1 => Some(Self::InputActivations),
            2 => Some(Self::Parameters),
            3 => Some(Self::OutputActivations),
            4..=7 => Some(Self::Interrupt(u32::from(raw) - 4)),
            _ => None,
        }
    }

    /// Encodes to the wire value.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Instructions => 0,
            Self::InputActivations => 1,
            Self::Parameters => 2,
            Self::OutputActivations => 3,
            Self::Interrupt(id) => 4 + id as u8,
        }
    }

    /// Index into per-bulk-out-tag tables; `None` for other classes.
    pub fn bulk_out_index(self) -> Option<usize> {
        match self {
            Self::Instructions => Some(0),
            Self::InputActivations => Some(1),
            Self::Parameters => Some(2),
            _ => None,
        }
    }
}

/// A DMA descriptor delivered through the event endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EventDescriptor {
    /// Transfer class.
    pub tag: DescriptorTag,
    /// Device virtual address of the transfer.
    pub device_address: u64,
    /// Transfer length in bytes.
    pub size_bytes: u32,
}

/// Raw payload of the interrupt endpoint: a bitmask of raised lines.
/// Bit 0 is the fatal error; bits 1.. are the top-level lines.
#[derive(Debug, Clone, Copy)]
pub struct InterruptInfo {
    /// The raised-line mask.
    pub raw_data: u32,
}

bitflags::bitflags! {
    /// Decoded view of [`InterruptInfo::raw_data`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptLines: u32 {
        /// Sticky fatal error.
        const FATAL_ERROR = 1 << 0;
        /// Top-level line 0.
        const TOP_LEVEL_0 = 1 << 1;
        /// Top-level line 1.
        const TOP_LEVEL_1 = 1 << 2;
        /// Top-level line 2.
        const TOP_LEVEL_2 = 1 << 3;
        /// Top-level line 3.
        const TOP_LEVEL_3 = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Endpoint classes allowed to originate descriptors over the event
    /// endpoint, as programmed into the descriptor-enable CSR.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorSources: u64 {
        /// Bulk in/out data descriptors.
        const BULK_DATA = 0x0F;
        /// Scalar-core interrupt descriptors.
        const SC_INTERRUPTS = 0xF0;
    }
}

/// Negotiated connection speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    /// USB 1.x low speed.
    Low,
    /// USB 1.x full speed.
    Full,
    /// USB 2 high speed.
    High,
    /// USB 3 super speed.
    Super,
    /// The stack could not report a speed.
    Unknown,
}

/// The 8-byte header prefixed to single-EP transfers: the tag, three
/// reserved bytes, then the payload length, little-endian.
pub fn prepare_header(tag: DescriptorTag, length: usize) -> [u8; 8] {
    let mut header = [0u8; 8];
    header[0] = tag.to_wire();
    header[4..8].copy_from_slice(&(length as u32).to_le_bytes());
    header
}

// -- Transfer buffers ----------------------------------------------------------

/// Read-only view handed to an outgoing transfer.
///
/// Carries a raw pointer because the memory is owned elsewhere (request
/// buffers, header boxes) and must stay valid until the transfer completes
/// or is cancelled.
#[derive(Debug, Clone, Copy)]
pub struct ConstTransfer {
    ptr: *const u8,
    len: usize,
}

// SAFETY: the pointed-to memory is kept alive and unmodified by the
// transport until the transfer resolves.
unsafe impl Send for ConstTransfer {}

impl ConstTransfer {
    /// Wraps `[ptr, ptr + len)`.
    ///
    /// # Safety
    ///
    /// The range must stay valid and unmodified until the transfer's
    /// completion callback has run.
    pub unsafe fn new(ptr: *const u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for an empty transfer.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bytes of the transfer.
    ///
    /// # Safety
    ///
    /// Only callable while the creation contract holds.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: deferred to the constructor contract.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Writable view handed to an incoming transfer.
#[derive(Debug, Clone, Copy)]
pub struct MutTransfer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the pointed-to memory is exclusively reserved for the transfer
// until it resolves.
unsafe impl Send for MutTransfer {}

impl MutTransfer {
    /// Wraps `[ptr, ptr + len)`.
    ///
    /// # Safety
    ///
    /// The range must stay valid and unaliased until the transfer's
    /// completion callback has run.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for an empty buffer.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The writable bytes of the transfer.
    ///
    /// # Safety
    ///
    /// Only callable while the creation contract holds.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: deferred to the constructor contract.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

// -- Callbacks -----------------------------------------------------------------

/// Completion of an outgoing transfer.
pub type BulkOutDone = Box<dyn FnOnce(Result<()>) + Send>;
/// Completion of an incoming transfer with the byte count received.
pub type BulkInDone = Box<dyn FnOnce(Result<()>, usize) + Send>;
/// Delivery of one event descriptor.
pub type EventDone = Box<dyn FnOnce(Result<()>, EventDescriptor) + Send>;
/// Delivery of one interrupt packet.
pub type InterruptDone = Box<dyn FnOnce(Result<()>, InterruptInfo) + Send>;

// -- Device traits -------------------------------------------------------------

/// A device in application mode.
pub trait UsbDevice: Send + Sync {
    /// Negotiated connection speed.
    fn device_speed(&self) -> DeviceSpeed;

    /// Claims `interface` for exclusive use.
    fn claim_interface(&self, interface: i32) -> Result<()>;

    /// Reads a CSR through a vendor control transfer.
    fn control_read_64(&self, offset: u64) -> Result<u64>;

    /// Writes a CSR through a vendor control transfer.
    fn control_write_64(&self, offset: u64, value: u64) -> Result<()>;

    /// Synchronous bulk-out transfer (software flow control needs the
    /// credit snapshot to stay accurate).
    fn sync_bulk_out(&self, endpoint: u8, data: ConstTransfer) -> Result<()>;

    /// Asynchronous bulk-out transfer.
    fn async_bulk_out(&self, endpoint: u8, data: ConstTransfer, done: BulkOutDone) -> Result<()>;

    /// Asynchronous bulk-in transfer.
    fn async_bulk_in(&self, endpoint: u8, buffer: MutTransfer, done: BulkInDone) -> Result<()>;

    /// Installs a standing read on the event endpoint.
    fn async_read_event(&self, done: EventDone) -> Result<()>;

    /// Installs a standing read on the interrupt endpoint.
    fn async_read_interrupt(&self, done: InterruptDone) -> Result<()>;

    /// Synthesizes `Cancelled` completions for every outstanding transfer.
    /// After return, no transfer buffer is accessed again.
    fn try_cancel_all_transfers(&self);

    /// Sends the DFU-detach request (application mode only).
    fn dfu_detach(&self) -> Result<()>;

    /// Closes the device, optionally through a port reset.
    fn close(&self, reset: bool) -> Result<()>;
}

/// USB device identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Vendor id.
    pub vendor_id: u16,
    /// Product id.
    pub product_id: u16,
}

/// A device in DFU (firmware download) mode.
pub trait DfuDevice: Send {
    /// Device identification.
    fn descriptor(&self) -> DeviceDescriptor;

    /// Claims the DFU interface.
    fn claim_interface(&self, interface: i32) -> Result<()>;

    /// Downloads and verifies a firmware image.
    fn download_firmware(&self, image: &[u8]) -> Result<()>;

    /// Closes the device, optionally through a port reset.
    fn close(&self, reset: bool) -> Result<()>;
}

/// What the factory found on the bus.
pub enum RawUsbDevice {
    /// The device is running application firmware.
    Application(std::sync::Arc<dyn UsbDevice>),
    /// The device awaits a firmware download.
    Dfu(Box<dyn DfuDevice>),
}

/// Opens raw devices; required for flows that reset and re-open (DFU).
pub trait UsbDeviceFactory: Send + Sync {
    /// Opens the device in whatever mode it currently runs.
    fn open(&self) -> Result<RawUsbDevice>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_wire_round_trip() {
        for raw in 0..8u8 {
            assert_eq!(DescriptorTag::from_wire(raw).unwrap().to_wire(), raw);
        }
        assert!(DescriptorTag::from_wire(8).is_none());
    }

    #[test]
    fn header_layout() {
        let header = prepare_header(DescriptorTag::Parameters, 0x1234);
        assert_eq!(header[0], 2);
        assert_eq!(&header[4..8], &0x1234u32.to_le_bytes());
    }
}
