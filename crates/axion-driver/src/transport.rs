//! The seam between the driver facade and its hardware back-ends.
//!
//! A [`Transport`] owns one way of talking to the device (MMIO or USB) plus
//! the DMA scheduler driving it. The facade calls down through this trait;
//! back-ends call up through [`HookRegistry`], installed by the facade after
//! construction, for completion fan-in, fatal errors and watchdog expiry.

use std::sync::{Arc, Mutex};

use axion_api::{Buffer, ClosingMode, Error, Result, Timing, TpuRequestKind};

use crate::device_buffer::MappedDeviceBuffer;
use crate::memory::space::DmaDirection;
use crate::registry::ExecutableReference;
use crate::request::Request;
use crate::tpu_request::TpuRequest;

/// Up-calls from a transport into the driver facade.
pub struct TransportHooks {
    /// A sub-request finished executing; the scheduler worker should look
    /// for more work.
    pub on_request_completion: Box<dyn Fn() + Send + Sync>,
    /// The device hit an unrecoverable fault.
    pub on_fatal_error: Box<dyn Fn(Error) + Send + Sync>,
    /// The device reported a thermal trip.
    pub on_thermal_warning: Box<dyn Fn() + Send + Sync>,
    /// The activity watchdog expired.
    pub on_watchdog_timeout: Box<dyn Fn() + Send + Sync>,
}

/// Slot where a transport's hooks live. Up-calls before installation are
/// dropped; that only happens while the facade is still being built.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Mutex<Option<Arc<TransportHooks>>>,
}

impl HookRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the facade's hooks.
    pub fn install(&self, hooks: TransportHooks) {
        *self.hooks.lock().unwrap() = Some(Arc::new(hooks));
    }

    fn current(&self) -> Option<Arc<TransportHooks>> {
        self.hooks.lock().unwrap().clone()
    }

    /// Fires the request-completion hook.
    pub fn request_completion(&self) {
        if let Some(hooks) = self.current() {
            (hooks.on_request_completion)();
        }
    }

    /// Fires the fatal-error hook.
    pub fn fatal_error(&self, error: Error) {
        if let Some(hooks) = self.current() {
            (hooks.on_fatal_error)(error);
        }
    }

    /// Fires the thermal-warning hook.
    pub fn thermal_warning(&self) {
        if let Some(hooks) = self.current() {
            (hooks.on_thermal_warning)();
        }
    }

    /// Fires the watchdog-timeout hook.
    pub fn watchdog_timeout(&self) {
        if let Some(hooks) = self.current() {
            (hooks.on_watchdog_timeout)();
        }
    }
}

/// One hardware back-end.
pub trait Transport: Send + Sync {
    /// The hook slot the facade installs its up-calls into.
    fn hooks(&self) -> &Arc<HookRegistry>;

    /// Brings the device up. In debug mode the execution pipelines stay
    /// halted for an external debugger.
    fn open(&self, debug_mode: bool) -> Result<()>;

    /// Tears the device down.
    fn close(&self, in_error: bool, mode: ClosingMode) -> Result<()>;

    /// Cancels pending sub-requests; waits for active ones unless the
    /// device is in error.
    fn cancel_and_wait_requests(&self, in_error: bool) -> Result<()>;

    /// Allocates a host buffer suitable for zero-copy DMA.
    fn make_buffer(&self, size_bytes: usize) -> Buffer;

    /// Maps a buffer into the device's address space for the lifetime of
    /// the returned handle.
    fn map_buffer(&self, buffer: &Buffer, direction: DmaDirection)
    -> Result<MappedDeviceBuffer>;

    /// Creates an empty sub-request bound to this transport's resources.
    fn create_tpu_request(
        &self,
        parent: Arc<Request>,
        executable: &Arc<ExecutableReference>,
        kind: TpuRequestKind,
    ) -> Result<Arc<TpuRequest>>;

    /// Validates, prepares and queues a sub-request for execution.
    fn submit(&self, request: Arc<TpuRequest>) -> Result<()>;

    /// Upper bound on unfinished device work, in cycles.
    fn max_remaining_cycles(&self) -> i64;

    /// The oldest sub-request still executing.
    fn oldest_active_request(&self) -> Result<Arc<TpuRequest>>;

    /// Whether this transport implements real-time admission.
    fn has_realtime_mode(&self) -> bool {
        false
    }

    /// Enters or leaves real-time mode.
    fn set_realtime_mode(&self, on: bool) -> Result<()>;

    /// Installs timing requirements for an executable.
    fn set_executable_timing(
        &self,
        executable: &Arc<ExecutableReference>,
        timing: &Timing,
    ) -> Result<()>;

    /// Removes timing requirements for an executable.
    fn remove_executable_timing(&self, executable: &Arc<ExecutableReference>) -> Result<()> {
        let _ = executable;
        Ok(())
    }

    /// Buffer allocation alignment of the chip behind this transport.
    fn allocation_alignment_bytes(&self) -> usize;
}
