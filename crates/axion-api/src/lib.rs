//! `axion-api` --- public API surface for the axion accelerator runtime.
//!
//! This crate defines the types a client of the driver touches directly:
//!
//! - [`Buffer`] -- a uniform handle over host, runtime-allocated,
//!   file-descriptor and on-device-DRAM memory.
//! - [`Error`] / [`Result`] -- the semantic error kinds every driver
//!   operation reports.
//! - [`DriverOptions`], [`OperationalSettings`], [`ClosingMode`] -- how a
//!   driver instance is configured and torn down.
//! - [`Timing`] and [`RequestTiming`] -- real-time admission parameters and
//!   per-request timestamps.
//! - [`Telemeter`] -- the hook production environments use to log device
//!   incidents.
//!
//! The driver implementation itself lives in `axion-driver`; nothing in this
//! crate talks to hardware.

pub mod alloc;
pub mod buffer;
pub mod dram;
pub mod error;
pub mod options;
pub mod telemetry;
pub mod timing;

// Re-export the common types at the crate root for ergonomic imports.
pub use alloc::AlignedBlock;
pub use buffer::Buffer;
pub use dram::DramBuffer;
pub use error::{Error, Result};
pub use options::{ClosingMode, DriverOptions, ExecutionPreference, OperationalSettings};
pub use telemetry::{DefaultTelemeter, ExecutionContext, LabeledContext, Telemeter};
pub use timing::{RequestTiming, Timing, TimingEvent, TimingEventKind, TpuRequestKind};
