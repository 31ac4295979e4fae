//! CSR access.
//!
//! The register interface is a contract: the MMIO transport fulfils it with
//! a mapped BAR through the kernel driver, the USB transport with vendor
//! control transfers, and tests with [`FakeRegisters`].

use std::collections::HashMap;
use std::sync::Mutex;

use axion_api::{Error, Result};

/// Register access over one device instance.
pub trait Registers: Send + Sync {
    /// Makes the register file accessible.
    fn open(&self) -> Result<()>;

    /// Releases register access.
    fn close(&self) -> Result<()>;

    /// Reads a 64-bit CSR.
    fn read_64(&self, offset: u64) -> Result<u64>;

    /// Writes a 64-bit CSR.
    fn write_64(&self, offset: u64, value: u64) -> Result<()>;

    /// Reads a 32-bit CSR.
    fn read_32(&self, offset: u64) -> Result<u32> {
        Ok(self.read_64(offset)? as u32)
    }

    /// Writes a 32-bit CSR.
    fn write_32(&self, offset: u64, value: u32) -> Result<()> {
        self.write_64(offset, u64::from(value))
    }

    /// Blocks until the CSR at `offset` reads `expected`.
    fn poll_64(&self, offset: u64, expected: u64) -> Result<()>;
}

/// In-memory register file for tests.
///
/// Reads return the last written value (default 0); `poll_64` succeeds
/// immediately against the stored value, and every write is logged for
/// sequence assertions.
#[derive(Default)]
pub struct FakeRegisters {
    state: Mutex<FakeRegistersState>,
}

#[derive(Default)]
struct FakeRegistersState {
    open: bool,
    values: HashMap<u64, u64>,
    writes: Vec<(u64, u64)>,
}

impl FakeRegisters {
    /// Creates a closed register file with all-zero contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a register value without logging a write.
    pub fn preload(&self, offset: u64, value: u64) {
        self.state.lock().unwrap().values.insert(offset, value);
    }

    /// Returns the write log so far.
    pub fn writes(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Last value written to `offset`, if any write happened.
    pub fn last_write(&self, offset: u64) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .rev()
            .find(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
    }
}

impl Registers for FakeRegisters {
    fn open(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.open {
            return Err(Error::failed_precondition("registers are already open"));
        }
        state.open = true;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(Error::failed_precondition("registers are not open"));
        }
        state.open = false;
        Ok(())
    }

    fn read_64(&self, offset: u64) -> Result<u64> {
        let state = self.state.lock().unwrap();
        if !state.open {
            return Err(Error::failed_precondition("registers are not open"));
        }
        Ok(state.values.get(&offset).copied().unwrap_or(0))
    }

    fn write_64(&self, offset: u64, value: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(Error::failed_precondition("registers are not open"));
        }
        state.values.insert(offset, value);
        state.writes.push((offset, value));
        Ok(())
    }

    fn poll_64(&self, offset: u64, expected: u64) -> Result<()> {
        let actual = self.read_64(offset)?;
        if actual != expected {
            return Err(Error::deadline_exceeded(format!(
                "register 0x{offset:x} reads 0x{actual:x}, expected 0x{expected:x}"
            )));
        }
        Ok(())
    }
}
