//! Driver construction options and runtime settings.

/// How the driver should wind down in-flight work on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingMode {
    /// Let requests that have started DMAing finish; cancel the rest.
    Graceful,
    /// Cancel everything, active or pending, as fast as possible.
    Asap,
}

/// Power/performance trade-off requested for a registered package.
///
/// Values are ordered by priority when several packages disagree: sustained
/// speed wins over low power.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPreference {
    /// Run at the absolute maximum performance.
    SingleFastAnswer,
    /// Optimise for power.
    LowPower,
    /// Maximum performance sustainable without thermal throttling.
    SustainedSpeed,
}

/// Operational settings that change how much work the scheduler admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationalSettings {
    /// Accelerator clock rate in hertz.
    pub tpu_frequency_hz: i64,
    /// Host-to-device transfer bandwidth in bytes per second.
    pub host_to_tpu_bps: i64,
}

/// Options fixed at driver construction time.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Upper bound on scheduled device work, in nanoseconds of estimated
    /// execution. Negative disables the cap and every sub-request is
    /// scheduled immediately.
    pub max_scheduled_work_ns: i64,
    /// Initial accelerator clock rate in hertz.
    pub tpu_frequency_hz: i64,
    /// Initial host-to-device bandwidth in bytes per second.
    pub host_to_tpu_bps: i64,
    /// Watchdog expiry for device activity, in nanoseconds.
    pub watchdog_timeout_ns: i64,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            max_scheduled_work_ns: -1,
            tpu_frequency_hz: 500_000_000,
            host_to_tpu_bps: 1_000_000_000,
            watchdog_timeout_ns: 2_000_000_000,
        }
    }
}

impl DriverOptions {
    /// Returns the initial [`OperationalSettings`] carried by these options.
    pub fn operational_settings(&self) -> OperationalSettings {
        OperationalSettings {
            tpu_frequency_hz: self.tpu_frequency_hz,
            host_to_tpu_bps: self.host_to_tpu_bps,
        }
    }
}
