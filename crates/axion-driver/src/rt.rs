//! Real-time admission control over the single-queue scheduler.
//!
//! Packages running at a frame rate register a [`Timing`] record. In
//! real-time mode every submission books its executable's maximum execution
//! time against the device; a submission that would overrun its own frame
//! budget, or eat into the slack another real-time executable needs before
//! its next frame, is rejected instead of queued. All bookkeeping is in
//! integer microseconds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axion_api::{ClosingMode, Error, Result, Timing};
use log::{debug, trace};

use crate::dma::DmaKind;
use crate::scheduler::{DmaToken, IssuedDma, SingleQueueDmaScheduler};
use crate::time::TimeStamper;
use crate::tpu_request::TpuRequest;
use crate::watchdog::Watchdog;

/// Identity of an executable reference, used as the timing key.
pub type ExecutableId = usize;

#[derive(Debug, Clone, Default)]
struct TimingRecord {
    timing: Timing,
    last_arrival_us: i64,
    last_completion_us: i64,
    booked_us: i64,
}

#[derive(Default)]
struct RtState {
    real_time_mode: bool,
    time_booked_us: i64,
    timings: HashMap<ExecutableId, TimingRecord>,
}

/// DMA scheduler with best-effort real-time admission.
pub struct RealTimeDmaScheduler {
    backing: SingleQueueDmaScheduler,
    time_stamper: Arc<dyn TimeStamper>,
    state: Mutex<RtState>,
}

impl RealTimeDmaScheduler {
    /// Wraps a fresh single-queue scheduler.
    pub fn new(watchdog: Watchdog, time_stamper: Arc<dyn TimeStamper>) -> Self {
        Self {
            backing: SingleQueueDmaScheduler::new(watchdog),
            time_stamper,
            state: Mutex::new(RtState::default()),
        }
    }

    /// Opens the backing scheduler.
    pub fn open(&self) -> Result<()> {
        self.backing.open()
    }

    /// Closes the backing scheduler.
    pub fn close(&self, mode: ClosingMode) -> Result<()> {
        self.backing.close(mode)
    }

    /// Submits a sub-request, applying admission control in real-time mode.
    pub fn submit(&self, request: Arc<TpuRequest>) -> Result<()> {
        let executable_id = request.executable_id();
        {
            let mut state = self.state.lock().unwrap();
            if state.real_time_mode {
                self.admit(&mut state, executable_id)?;
            }
        }
        let result = self.backing.submit(request);
        if result.is_err() {
            // Roll the booking back; the work never entered the queue.
            let mut state = self.state.lock().unwrap();
            if state.real_time_mode {
                Self::release(&mut state, executable_id);
            }
        }
        result
    }

    /// Forwards a device execution completion and releases the booking of
    /// the request that finished.
    pub fn notify_request_completion(&self) -> Result<()> {
        if let Ok(oldest) = self.backing.oldest_active_request() {
            let mut state = self.state.lock().unwrap();
            let id = oldest.executable_id();
            Self::release(&mut state, id);
            let now = self.time_stamper.now_us();
            if let Some(record) = state.timings.get_mut(&id) {
                record.last_completion_us = now;
            }
        }
        self.backing.notify_request_completion()
    }

    /// Enters or leaves real-time mode. Stored timing survives toggling.
    pub fn set_realtime_mode(&self, on: bool) {
        let mut state = self.state.lock().unwrap();
        if state.real_time_mode != on {
            debug!("real-time mode {}", if on { "enabled" } else { "disabled" });
        }
        state.real_time_mode = on;
        if !on {
            state.time_booked_us = 0;
            for record in state.timings.values_mut() {
                record.booked_us = 0;
            }
        }
    }

    /// Installs or updates the timing record of an executable. Fields set
    /// to -1 keep their stored value.
    pub fn set_executable_timing(&self, id: ExecutableId, timing: &Timing) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut merged = state
            .timings
            .get(&id)
            .map(|record| record.timing)
            .unwrap_or_default();
        if timing.fps >= 0 {
            merged.fps = timing.fps;
        }
        if timing.max_execution_time_ms >= 0 {
            merged.max_execution_time_ms = timing.max_execution_time_ms;
        }
        if timing.tolerance_ms >= 0 {
            merged.tolerance_ms = timing.tolerance_ms;
        }
        if merged.has_real_time_requirements() {
            let frame_ms = 1000 / i64::from(merged.fps);
            let slack_ms = frame_ms - i64::from(merged.max_execution_time_ms);
            if i64::from(merged.tolerance_ms) > slack_ms || merged.tolerance_ms < 0 {
                return Err(Error::invalid_argument(format!(
                    "tolerance {} ms outside [0, {} ms]",
                    merged.tolerance_ms, slack_ms
                )));
            }
        }
        let entry = state.timings.entry(id).or_default();
        entry.timing = merged;
        trace!("timing for executable {id:#x}: {merged:?}");
        Ok(())
    }

    /// Removes an executable's timing record.
    pub fn remove_executable_timing(&self, id: ExecutableId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.timings.remove(&id) {
            state.time_booked_us -= record.booked_us;
        }
        Ok(())
    }

    /// Returns an executable's timing record.
    pub fn executable_timing(&self, id: ExecutableId) -> Result<Timing> {
        let state = self.state.lock().unwrap();
        state
            .timings
            .get(&id)
            .map(|record| record.timing)
            .ok_or_else(|| Error::not_found("no timing registered for executable"))
    }

    /// Clears all timing records.
    pub fn reset_timing(&self) {
        let mut state = self.state.lock().unwrap();
        state.timings.clear();
        state.time_booked_us = 0;
    }

    // Pass-through DMA plumbing.

    /// See [`SingleQueueDmaScheduler::peek_next_dma`].
    pub fn peek_next_dma(&self) -> DmaKind {
        self.backing.peek_next_dma()
    }

    /// See [`SingleQueueDmaScheduler::get_next_dma`].
    pub fn get_next_dma(&self) -> Result<Option<IssuedDma>> {
        self.backing.get_next_dma()
    }

    /// See [`SingleQueueDmaScheduler::notify_dma_completion`].
    pub fn notify_dma_completion(&self, token: DmaToken) -> Result<()> {
        self.backing.notify_dma_completion(token)
    }

    /// See [`SingleQueueDmaScheduler::cancel_pending_requests`].
    pub fn cancel_pending_requests(&self) -> Result<()> {
        self.backing.cancel_pending_requests()
    }

    /// See [`SingleQueueDmaScheduler::wait_active_requests`].
    pub fn wait_active_requests(&self) -> Result<()> {
        self.backing.wait_active_requests()
    }

    /// See [`SingleQueueDmaScheduler::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.backing.is_empty()
    }

    /// See [`SingleQueueDmaScheduler::max_remaining_cycles`].
    pub fn max_remaining_cycles(&self) -> i64 {
        self.backing.max_remaining_cycles()
    }

    /// See [`SingleQueueDmaScheduler::oldest_active_request`].
    pub fn oldest_active_request(&self) -> Result<Arc<TpuRequest>> {
        self.backing.oldest_active_request()
    }

    /// Books `id`'s maximum execution time or rejects the submission.
    fn admit(&self, state: &mut RtState, id: ExecutableId) -> Result<()> {
        let now = self.time_stamper.now_us();
        let Some(record) = state.timings.get(&id) else {
            // Executables without timing information are not subject to
            // admission.
            return Ok(());
        };
        if !record.timing.has_real_time_requirements() {
            return Ok(());
        }
        let met_us = record.timing.max_execution_time_us();
        let frame_us = record.timing.frame_time_us()?;
        let budget_us = frame_us + record.timing.tolerance_us();

        if state.time_booked_us + met_us > budget_us {
            return Err(Error::deadline_exceeded(format!(
                "booking {met_us} us on top of {} us exceeds the {budget_us} us frame budget",
                state.time_booked_us
            )));
        }

        // Would this booking starve another real-time executable before its
        // next expected frame?
        for (other_id, other) in &state.timings {
            if *other_id == id || !other.timing.has_real_time_requirements() {
                continue;
            }
            if other.last_arrival_us == 0 {
                continue;
            }
            let other_frame_us = other.timing.frame_time_us()?;
            let next_arrival_us = other.last_arrival_us + other_frame_us;
            let slack_us =
                next_arrival_us + other.timing.tolerance_us() - now - other.timing.max_execution_time_us();
            if state.time_booked_us + met_us > slack_us.max(0) {
                return Err(Error::deadline_exceeded(format!(
                    "booking {met_us} us would starve executable {other_id:#x}"
                )));
            }
        }

        state.time_booked_us += met_us;
        let record = state.timings.get_mut(&id).unwrap();
        record.booked_us += met_us;
        record.last_arrival_us = now;
        Ok(())
    }

    /// Releases one booking of `id`, if any.
    fn release(state: &mut RtState, id: ExecutableId) {
        if let Some(record) = state.timings.get_mut(&id) {
            let met_us = record.timing.max_execution_time_us().min(record.booked_us);
            record.booked_us -= met_us;
            state.time_booked_us = (state.time_booked_us - met_us).max(0);
        }
    }
}
