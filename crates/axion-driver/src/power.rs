//! Power, reset, run control and scalar-core plumbing.
//!
//! Thin CSR pokers, split by hardware block the way the chip groups them.
//! The clock-gating policy (software gate between submissions, hardware
//! gate while idle) is driven by the transport; these types only flip the
//! bits.

use std::sync::{Arc, Mutex};

use axion_api::Result;
use log::trace;

use crate::chip::{PowerCsrOffsets, ScalarCoreCsrOffsets};
use crate::registers::Registers;

/// Run control commands for the scalar core and tile array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    /// Park the pipelines.
    MoveToIdle = 0,
    /// Start executing.
    MoveToRun = 1,
    /// Halt at the next boundary.
    MoveToHalt = 2,
    /// Single-step (debugger use).
    MoveToSingleStep = 3,
}

/// Run status as reported by the pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Parked.
    Idle = 0,
    /// Executing.
    Run = 1,
    /// Single-stepping.
    SingleStep = 2,
    /// Halting at the next boundary.
    Halting = 3,
    /// Halted.
    Halted = 4,
}

/// Reset and clock-gate control.
pub struct TopLevelHandler {
    registers: Arc<dyn Registers>,
    offsets: PowerCsrOffsets,
}

impl TopLevelHandler {
    /// Creates the handler over `registers`.
    pub fn new(registers: Arc<dyn Registers>, offsets: PowerCsrOffsets) -> Self {
        Self { registers, offsets }
    }

    /// Enables the software clock gate (idle power saving between
    /// submissions).
    pub fn enable_software_clock_gate(&self) -> Result<()> {
        trace!("software clock gate on");
        self.registers.write_64(self.offsets.software_clock_gate, 1)
    }

    /// Disables the software clock gate so the chip is accessible.
    pub fn disable_software_clock_gate(&self) -> Result<()> {
        trace!("software clock gate off");
        self.registers.write_64(self.offsets.software_clock_gate, 0)
    }

    /// Enables the hardware (idle-detect) clock gate.
    pub fn enable_hardware_clock_gate(&self) -> Result<()> {
        self.registers.write_64(self.offsets.hardware_clock_gate, 1)
    }

    /// Disables the hardware clock gate.
    pub fn disable_hardware_clock_gate(&self) -> Result<()> {
        self.registers.write_64(self.offsets.hardware_clock_gate, 0)
    }

    /// Asserts block reset.
    pub fn enable_reset(&self) -> Result<()> {
        self.registers.write_64(self.offsets.reset, 1)
    }

    /// Releases block reset.
    pub fn quit_reset(&self) -> Result<()> {
        self.registers.write_64(self.offsets.reset, 0)
    }
}

/// Moves the execution pipelines between run states.
pub struct RunController {
    registers: Arc<dyn Registers>,
    offsets: ScalarCoreCsrOffsets,
}

impl RunController {
    /// Creates the controller over `registers`.
    pub fn new(registers: Arc<dyn Registers>, offsets: ScalarCoreCsrOffsets) -> Self {
        Self { registers, offsets }
    }

    /// Applies `control` to the scalar core and the tile array.
    pub fn do_run_control(&self, control: RunControl) -> Result<()> {
        trace!("run control: {control:?}");
        self.registers
            .write_64(self.offsets.run_control, control as u64)?;
        self.registers
            .write_64(self.offsets.tile_run_control, control as u64)
    }
}

/// Scalar-core-to-host interrupt bookkeeping.
pub struct ScalarCoreController {
    registers: Arc<dyn Registers>,
    offsets: ScalarCoreCsrOffsets,
    /// Interrupt counts observed so far, per line. The hardware counter
    /// only ever increments; completions since the last check are the
    /// delta.
    last_counts: Mutex<[u64; 4]>,
}

impl ScalarCoreController {
    /// Creates the controller over `registers`.
    pub fn new(registers: Arc<dyn Registers>, offsets: ScalarCoreCsrOffsets) -> Self {
        Self {
            registers,
            offsets,
            last_counts: Mutex::new([0; 4]),
        }
    }

    /// Brings the block online.
    pub fn open(&self) -> Result<()> {
        *self.last_counts.lock().unwrap() = [0; 4];
        Ok(())
    }

    /// Shuts the block down.
    pub fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Unmasks all four host interrupts.
    pub fn enable_interrupts(&self) -> Result<()> {
        self.registers.write_64(self.offsets.host_interrupt_enable, 0xF)
    }

    /// Masks all four host interrupts.
    pub fn disable_interrupts(&self) -> Result<()> {
        self.registers.write_64(self.offsets.host_interrupt_enable, 0)
    }

    /// Acknowledges interrupt `id`. Must happen before reading the count,
    /// or a concurrent increment could be missed.
    pub fn clear_interrupt_status(&self, id: u32) -> Result<()> {
        self.registers
            .write_64(self.offsets.host_interrupt_status_base + u64::from(id) * 8, 1)
    }

    /// Completions signalled on line `id` since the last check.
    pub fn check_interrupt_counts(&self, id: u32) -> Result<u64> {
        let total = self
            .registers
            .read_64(self.offsets.host_interrupt_count_base + u64::from(id) * 8)?;
        let mut last = self.last_counts.lock().unwrap();
        let delta = total.saturating_sub(last[id as usize]);
        last[id as usize] = total;
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::CsrLayout;
    use crate::registers::FakeRegisters;

    #[test]
    fn interrupt_counts_report_deltas() {
        let layout = CsrLayout::a1();
        let registers = Arc::new(FakeRegisters::new());
        registers.open().unwrap();
        let controller =
            ScalarCoreController::new(Arc::clone(&registers) as Arc<dyn Registers>, layout.scalar);
        controller.open().unwrap();

        let count_offset = layout.scalar.host_interrupt_count_base;
        registers.preload(count_offset, 3);
        assert_eq!(controller.check_interrupt_counts(0).unwrap(), 3);
        registers.preload(count_offset, 5);
        assert_eq!(controller.check_interrupt_counts(0).unwrap(), 2);
        assert_eq!(controller.check_interrupt_counts(0).unwrap(), 0);
    }

    #[test]
    fn run_control_touches_both_pipelines() {
        let layout = CsrLayout::a1();
        let registers = Arc::new(FakeRegisters::new());
        registers.open().unwrap();
        let controller =
            RunController::new(Arc::clone(&registers) as Arc<dyn Registers>, layout.scalar);
        controller.do_run_control(RunControl::MoveToRun).unwrap();
        assert_eq!(registers.last_write(layout.scalar.run_control), Some(1));
        assert_eq!(registers.last_write(layout.scalar.tile_run_control), Some(1));
    }
}
