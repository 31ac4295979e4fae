//! Wire-format constants and small shared record types.
//!
//! All multi-byte fields are little-endian. Variable-length fields are
//! prefixed with a `u32` byte or element count.

/// 4-byte tag opening every package.
pub const PACKAGE_MAGIC: [u8; 4] = *b"DWN1";

/// Wire-format version this crate reads and writes.
pub const PACKAGE_VERSION: u32 = 1;

/// Chip the package was compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chip {
    /// First-generation axion core.
    A1,
    /// Unknown chip id, preserved verbatim.
    Other(u32),
}

impl Chip {
    /// Decodes the wire id.
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            1 => Self::A1,
            other => Self::Other(other),
        }
    }

    /// Encodes to the wire id.
    pub fn to_wire(self) -> u32 {
        match self {
            Self::A1 => 1,
            Self::Other(raw) => raw,
        }
    }
}

/// Role of one executable inside a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutableKind {
    /// Self-contained executable carrying its own parameters.
    Standalone,
    /// Uploads parameters into on-device memory for later inferences.
    ParameterCaching,
    /// Runs inference against previously cached parameters.
    Inference,
}

impl ExecutableKind {
    /// Decodes the wire id.
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Standalone),
            1 => Some(Self::ParameterCaching),
            2 => Some(Self::Inference),
            _ => None,
        }
    }

    /// Encodes to the wire id.
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Standalone => 0,
            Self::ParameterCaching => 1,
            Self::Inference => 2,
        }
    }
}

/// Element type of a tensor layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Unsigned 8-bit fixed point.
    FixedPoint8,
    /// Unsigned 16-bit fixed point.
    FixedPoint16,
    /// Signed 8-bit fixed point.
    SignedFixedPoint8,
    /// Signed 16-bit fixed point.
    SignedFixedPoint16,
    /// Signed 32-bit fixed point.
    SignedFixedPoint32,
    /// 16-bit brain float.
    BFloat,
    /// IEEE half precision.
    Half,
    /// IEEE single precision.
    Single,
}

impl DataType {
    /// Decodes the wire id.
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::FixedPoint8),
            1 => Some(Self::FixedPoint16),
            2 => Some(Self::SignedFixedPoint8),
            3 => Some(Self::SignedFixedPoint16),
            4 => Some(Self::SignedFixedPoint32),
            5 => Some(Self::BFloat),
            6 => Some(Self::Half),
            7 => Some(Self::Single),
            _ => None,
        }
    }

    /// Encodes to the wire id.
    pub fn to_wire(self) -> u32 {
        match self {
            Self::FixedPoint8 => 0,
            Self::FixedPoint16 => 1,
            Self::SignedFixedPoint8 => 2,
            Self::SignedFixedPoint16 => 3,
            Self::SignedFixedPoint32 => 4,
            Self::BFloat => 5,
            Self::Half => 6,
            Self::Single => 7,
        }
    }

    /// Size of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            Self::FixedPoint8 | Self::SignedFixedPoint8 => 1,
            Self::FixedPoint16 | Self::SignedFixedPoint16 | Self::BFloat | Self::Half => 2,
            Self::SignedFixedPoint32 | Self::Single => 4,
        }
    }
}

/// What a patched instruction field refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOffsetKind {
    /// The request's scratch base address.
    Scratch,
    /// The executable's parameter base address.
    Parameter,
    /// A named input layer's address for one batch element.
    Input,
    /// A named output layer's address for one batch element.
    Output,
}

impl FieldOffsetKind {
    /// Decodes the wire id.
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Scratch),
            1 => Some(Self::Parameter),
            2 => Some(Self::Input),
            3 => Some(Self::Output),
            _ => None,
        }
    }

    /// Encodes to the wire id.
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Scratch => 0,
            Self::Parameter => 1,
            Self::Input => 2,
            Self::Output => 3,
        }
    }
}

/// One address patch point inside an instruction bitstream chunk.
///
/// The resolved device address is written 32 bits at a time, little-endian,
/// starting at `bit_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldOffset {
    /// Patch target.
    pub kind: FieldOffsetKind,
    /// Layer name for `Input`/`Output` kinds; empty otherwise.
    pub name: String,
    /// Batch element for `Input`/`Output` kinds.
    pub batch: u32,
    /// Bit offset of the 32-bit patch window within the chunk.
    pub bit_offset: u32,
}

/// One chunk of the instruction bitstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionChunk {
    /// Raw instruction bytes. Copied and patched per request.
    pub bitstream: Vec<u8>,
    /// Address patch points into `bitstream`.
    pub field_offsets: Vec<FieldOffset>,
}

/// Which bound buffer a DMA descriptor hint targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaHintTarget {
    /// A named input activation buffer.
    InputActivation,
    /// A named output activation buffer.
    OutputActivation,
    /// The executable's parameter buffer.
    Parameter,
    /// The request's scratch buffer.
    Scratch,
}

/// Transfer direction for scratch descriptor hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedDirection {
    /// Host to device.
    Infeed,
    /// Device to host.
    Outfeed,
}

/// One compiler-emitted DMA hint.
///
/// Hints are ordered; the transport replays them as the DMA plan of one
/// sub-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmaHint {
    /// Bulk data transfer against a bound buffer.
    Descriptor {
        /// Target buffer class.
        target: DmaHintTarget,
        /// Transfer direction; meaningful for `Scratch` targets, which feed
        /// both ways.
        direction: FeedDirection,
        /// Layer name for activation targets; empty otherwise.
        name: String,
        /// Batch element for activation targets.
        batch: u32,
        /// Byte offset into the target buffer.
        offset: u64,
        /// Transfer size in bytes.
        size: u64,
    },
    /// Transfer of one instruction chunk.
    Instruction {
        /// Index into the executable's chunk list.
        chunk_index: u32,
    },
    /// Scalar-core-to-host interrupt.
    Interrupt {
        /// Interrupt id, 0..=3. Id 0 signals sub-request completion.
        id: u32,
    },
    /// Fence over all earlier DMAs of the same sub-request.
    LocalFence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_wire_round_trip() {
        for raw in 0..8 {
            let ty = DataType::from_wire(raw).unwrap();
            assert_eq!(ty.to_wire(), raw);
        }
        assert!(DataType::from_wire(8).is_none());
    }

    #[test]
    fn data_type_sizes() {
        assert_eq!(DataType::FixedPoint8.size_bytes(), 1);
        assert_eq!(DataType::SignedFixedPoint16.size_bytes(), 2);
        assert_eq!(DataType::Single.size_bytes(), 4);
    }
}
