//! Memory-mapped transport.
//!
//! Talks to the device through a register BAR set up by a kernel driver:
//! instructions go through a hardware-consumed host queue, completions and
//! errors come back as interrupts.

pub mod host_queue;
pub mod interrupt;
pub mod transport;

pub use host_queue::{HostQueue, HostQueueDescriptor, HostQueueStatusBlock};
pub use interrupt::{FakeInterruptHandler, Interrupt, InterruptHandler, MsixTableEntry};
pub use transport::MmioTransport;
