//! Interrupt demultiplexing contracts.
//!
//! Interrupt delivery (MSI-X vectors, eventfds, ...) is platform plumbing;
//! the transport only needs to claim lines and attach handlers. The fake
//! implementation lets tests raise interrupts by hand.

use std::collections::HashMap;
use std::sync::Mutex;

use axion_api::{Error, Result};

/// Interrupt lines the transport claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interrupt {
    /// Instruction queue consumed one or more descriptors.
    InstructionQueue,
    /// Scalar-core-to-host interrupt 0..=3; 0 signals execution completion.
    ScalarCoreHost(u32),
    /// One of the top-level lines (thermal and friends).
    TopLevel(u32),
    /// Sticky fatal error.
    FatalError,
}

/// One MSI-X table entry, as laid out by the PCI spec (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsixTableEntry {
    /// Address the interrupt write targets.
    pub message_address: u64,
    /// Payload of the interrupt write.
    pub message_data: u32,
    /// Bit 0 masks the vector; the rest is reserved.
    pub vector_control: u32,
}

const _: () = assert!(size_of::<MsixTableEntry>() == 16);

/// Claims interrupt lines and dispatches them to registered handlers.
///
/// Handlers run on the platform's interrupt thread; they may perform
/// synchronous CSR access.
pub trait InterruptHandler: Send + Sync {
    /// Claims the lines.
    fn open(&self) -> Result<()>;

    /// Releases the lines. With `in_error` pending deliveries are dropped
    /// instead of drained.
    fn close(&self, in_error: bool) -> Result<()>;

    /// Attaches `handler` to `interrupt`.
    fn register(&self, interrupt: Interrupt, handler: Box<dyn Fn() + Send + Sync>) -> Result<()>;
}

/// Test interrupt handler: registered handlers fire on demand.
#[derive(Default)]
pub struct FakeInterruptHandler {
    handlers: Mutex<HashMap<Interrupt, Box<dyn Fn() + Send + Sync>>>,
    open: Mutex<bool>,
}

impl FakeInterruptHandler {
    /// Creates a handler with no lines claimed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises `interrupt`, running its handler on the calling thread.
    pub fn raise(&self, interrupt: Interrupt) {
        let handlers = self.handlers.lock().unwrap();
        if let Some(handler) = handlers.get(&interrupt) {
            handler();
        }
    }
}

impl InterruptHandler for FakeInterruptHandler {
    fn open(&self) -> Result<()> {
        let mut open = self.open.lock().unwrap();
        if *open {
            return Err(Error::failed_precondition("interrupts already claimed"));
        }
        *open = true;
        Ok(())
    }

    fn close(&self, _in_error: bool) -> Result<()> {
        let mut open = self.open.lock().unwrap();
        *open = false;
        self.handlers.lock().unwrap().clear();
        Ok(())
    }

    fn register(&self, interrupt: Interrupt, handler: Box<dyn Fn() + Send + Sync>) -> Result<()> {
        self.handlers.lock().unwrap().insert(interrupt, handler);
        Ok(())
    }
}
