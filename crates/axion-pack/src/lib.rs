//! `axion-pack` --- parser and writer for the packed executable-package
//! format consumed by the axion runtime, plus the tensor transforms that
//! re-shape data between the accelerator's tile order and user layouts.
//!
//! A package is a little-endian, length-prefixed container identified by the
//! 4-byte tag `"DWN1"`. It holds up to three executables (stand-alone,
//! parameter-caching, inference), each carrying layer metadata, an
//! instruction bitstream with address patch points, a parameter blob,
//! scratch requirements and ordered DMA hints.
//!
//! Parsing produces fully-owned structures; the driver keeps them alive for
//! the lifetime of a registration and reads them lock-free.

pub mod format;
pub mod layer;
pub mod parse;
pub mod relayout;
pub mod shape;
pub mod writer;

pub use format::{
    Chip, DataType, DmaHint, DmaHintTarget, ExecutableKind, FeedDirection, FieldOffset,
    FieldOffsetKind, InstructionChunk, PACKAGE_MAGIC,
};
pub use layer::{LayerInfo, OutputLayout};
pub use parse::{Executable, Package, parse_package};
pub use writer::{ExecutableBuilder, LayerBuilder, PackageBuilder};
