//! Bulk-USB transport.
//!
//! All device traffic rides four endpoint classes: bulk-out for
//! instructions, input activations and parameters (one shared or three
//! dedicated endpoints, depending on the operating mode), bulk-in for
//! output activations, an event endpoint delivering DMA descriptors, and
//! an interrupt endpoint for error and top-level lines. A dedicated worker
//! thread owns all device I/O.

pub mod device;
pub mod io_request;
pub mod registers;
pub mod transport;

pub use device::{
    DescriptorTag, DeviceDescriptor, DeviceSpeed, DfuDevice, EventDescriptor, InterruptInfo,
    RawUsbDevice, UsbDevice, UsbDeviceFactory,
};
pub use transport::{OperatingMode, UsbOptions, UsbTransport};
