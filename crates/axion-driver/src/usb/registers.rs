//! CSR access over USB control transfers.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axion_api::{Error, Result};

use crate::registers::Registers;
use crate::usb::device::UsbDevice;

/// How long [`Registers::poll_64`] keeps retrying.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// Delay between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// [`Registers`] implementation tunnelling through vendor control
/// transfers on the active device.
#[derive(Default)]
pub struct UsbRegisters {
    device: Mutex<Option<Arc<dyn UsbDevice>>>,
}

impl UsbRegisters {
    /// Creates a register file with no device attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the active device.
    pub fn set_device(&self, device: Arc<dyn UsbDevice>) {
        *self.device.lock().unwrap() = Some(device);
    }

    fn device(&self) -> Result<Arc<dyn UsbDevice>> {
        self.device
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::failed_precondition("no USB device attached"))
    }
}

impl Registers for UsbRegisters {
    fn open(&self) -> Result<()> {
        self.device().map(|_| ())
    }

    fn close(&self) -> Result<()> {
        *self.device.lock().unwrap() = None;
        Ok(())
    }

    fn read_64(&self, offset: u64) -> Result<u64> {
        self.device()?.control_read_64(offset)
    }

    fn write_64(&self, offset: u64, value: u64) -> Result<()> {
        self.device()?.control_write_64(offset, value)
    }

    fn poll_64(&self, offset: u64, expected: u64) -> Result<()> {
        let device = self.device()?;
        let deadline = Instant::now() + POLL_TIMEOUT;
        loop {
            if device.control_read_64(offset)? == expected {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::deadline_exceeded(format!(
                    "register 0x{offset:x} did not reach 0x{expected:x}"
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
