//! Timing records: real-time admission parameters and per-request
//! timestamps.

use crate::error::{Error, Result};

/// Real-time requirements for a registered executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timing {
    /// Inference arrival rate, frames per second. 0 means no real-time
    /// requirement.
    pub fps: i32,
    /// Maximum execution time in milliseconds.
    pub max_execution_time_ms: i32,
    /// How far an inference may be delayed, in milliseconds.
    /// `0 <= tolerance_ms <= 1000/fps - max_execution_time_ms`.
    pub tolerance_ms: i32,
}

impl Timing {
    /// Returns the per-frame budget in microseconds, or an error for 0 FPS.
    pub fn frame_time_us(&self) -> Result<i64> {
        if self.fps == 0 {
            return Err(Error::invalid_argument(
                "cannot compute frame time for 0 FPS",
            ));
        }
        Ok(1_000_000 / i64::from(self.fps))
    }

    /// Maximum execution time in microseconds.
    pub fn max_execution_time_us(&self) -> i64 {
        i64::from(self.max_execution_time_ms) * 1000
    }

    /// Tolerance in microseconds.
    pub fn tolerance_us(&self) -> i64 {
        i64::from(self.tolerance_ms) * 1000
    }

    /// True when this timing carries a real-time requirement.
    pub fn has_real_time_requirements(&self) -> bool {
        self.fps > 0
    }
}

/// Classifies a hardware sub-request for timing and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpuRequestKind {
    /// Uploads cached parameters to on-device memory.
    ParameterCaching,
    /// Runs one hardware batch of inference.
    Inference,
}

/// What happened to a sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingEventKind {
    /// The sub-request was handed to the transport.
    Submitted,
    /// The sub-request finished on the device.
    Completed,
}

/// One fine-grained timing event of a request.
#[derive(Debug, Clone, Copy)]
pub struct TimingEvent {
    /// When the event occurred, nanoseconds on the driver clock.
    pub timestamp_ns: i64,
    /// Which kind of sub-request this concerns.
    pub request_kind: TpuRequestKind,
    /// Submission or completion.
    pub event_kind: TimingEventKind,
}

/// Timestamps of one user request.
///
/// For batched requests `submitted_ns` is the submission of the first
/// sub-request and `completed_ns` the completion of the last one.
#[derive(Debug, Clone, Default)]
pub struct RequestTiming {
    /// When the request object was created.
    pub created_ns: i64,
    /// When the first sub-request went to the device.
    pub submitted_ns: i64,
    /// When the last sub-request completed.
    pub completed_ns: i64,
    /// Per-sub-request detail events in occurrence order.
    pub detail_events: Vec<TimingEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_time_splits_one_second() {
        let timing = Timing {
            fps: 25,
            max_execution_time_ms: 10,
            tolerance_ms: 5,
        };
        assert_eq!(timing.frame_time_us().unwrap(), 40_000);
    }

    #[test]
    fn zero_fps_has_no_frame_time() {
        assert!(Timing::default().frame_time_us().is_err());
        assert!(!Timing::default().has_real_time_requirements());
    }
}
