//! Telemetry hooks.
//!
//! Production environments attach a [`Telemeter`] to record device incidents
//! against the execution context of the model that triggered them. The
//! default implementation drops everything.

use std::fmt::Debug;

/// Opaque, client-owned context describing where a package executes.
///
/// The runtime never inspects it; it is only handed back through telemetry
/// callbacks so the client can attribute incidents.
pub trait ExecutionContext: Debug + Send + Sync {}

/// A minimal execution context carrying a label.
#[derive(Debug)]
pub struct LabeledContext(pub String);

impl ExecutionContext for LabeledContext {}

/// Sink for device incident telemetry.
pub trait Telemeter: Send + Sync {
    /// Records that the activity watchdog expired while the request bound to
    /// `context` was the oldest active work on the device.
    fn log_watchdog_timeout(&self, context: &dyn ExecutionContext);
}

/// Telemeter that drops all events.
#[derive(Debug, Default)]
pub struct DefaultTelemeter;

impl Telemeter for DefaultTelemeter {
    fn log_watchdog_timeout(&self, _context: &dyn ExecutionContext) {}
}
