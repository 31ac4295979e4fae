//! `axion-driver` --- userspace driver core for the axion neural-network
//! accelerator.
//!
//! The driver accepts pre-compiled model packages, accepts inference
//! requests carrying named input/output tensors, schedules their execution
//! on one accelerator instance and returns output tensors. The crate is
//! organised in layers:
//!
//! - **Memory** ([`memory`], [`mapper`], [`device_buffer`]) -- mapping host
//!   buffers into the device's address space, with page coalescing.
//! - **Registry** ([`registry`], [`instruction`]) -- parsed packages, their
//!   parameter residency and reusable instruction buffers.
//! - **Requests** ([`request`], [`tpu_request`]) -- decomposing a user
//!   request into hardware-sized sub-requests and tracking completion.
//! - **Scheduling** ([`dma`], [`scheduler`], [`rt`], [`watchdog`]) --
//!   ordering and fencing DMA descriptors, best-effort real-time admission,
//!   hang detection.
//! - **Transports** ([`mmio`], [`usb`]) -- the memory-mapped and bulk-USB
//!   back-ends.
//! - **Facade** ([`driver`], [`transport`]) -- the client-facing driver
//!   object: open/close counting, priority queues, the scheduler worker.

pub mod blocking;
pub mod chip;
pub mod device_buffer;
pub mod dma;
pub mod driver;
pub mod instruction;
pub mod mapper;
pub mod memory;
pub mod mmio;
pub mod power;
pub mod registers;
pub mod registry;
pub mod request;
pub mod rt;
pub mod scheduler;
pub mod time;
pub mod tpu_request;
pub mod transport;
pub mod usb;
pub mod watchdog;

pub use device_buffer::{DeviceBuffer, MappedDeviceBuffer};
pub use driver::Driver;
pub use registry::{ExecutableReference, PackageReference, PackageRegistry};
pub use request::Request;
pub use transport::Transport;
