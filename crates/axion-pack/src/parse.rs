//! Package deserialization.
//!
//! The format is a flat little-endian stream read through a bounds-checked
//! [`Reader`] cursor. Parsing copies everything into owned structures; the
//! input bytes can be dropped immediately afterwards.

use std::fmt;

use crate::format::{
    Chip, DataType, DmaHint, DmaHintTarget, ExecutableKind, FeedDirection, FieldOffset,
    FieldOffsetKind, InstructionChunk, PACKAGE_MAGIC, PACKAGE_VERSION,
};
use crate::layer::{LayerInfo, OutputLayout};
use crate::shape::{DimRange, NUM_DIMENSIONS, SliceLayout, TensorLayout, TensorShape};

/// Errors produced while decoding a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The input ended before a field was complete.
    Truncated,
    /// The leading 4-byte tag was not `"DWN1"`.
    BadMagic([u8; 4]),
    /// The format version is not supported.
    UnsupportedVersion(u32),
    /// An enum field held an unknown wire value.
    UnknownEnum {
        /// Which enum field was being decoded.
        what: &'static str,
        /// The offending wire value.
        value: u32,
    },
    /// A string field was not valid UTF-8.
    BadString,
    /// A layout table length disagreed with the layer dimensions.
    TableLength {
        /// Which table was malformed.
        table: &'static str,
        /// Expected element count.
        expected: usize,
        /// Actual element count.
        actual: usize,
    },
    /// The package carried no executables or an invalid combination.
    BadExecutableSet(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => f.write_str("package truncated"),
            Self::BadMagic(tag) => write!(f, "bad package tag {tag:02x?}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported package version {v}"),
            Self::UnknownEnum { what, value } => write!(f, "unknown {what} value {value}"),
            Self::BadString => f.write_str("string field is not valid UTF-8"),
            Self::TableLength {
                table,
                expected,
                actual,
            } => write!(
                f,
                "layout table {table} has {actual} entries, expected {expected}"
            ),
            Self::BadExecutableSet(msg) => write!(f, "bad executable set: {msg}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// One parsed executable.
#[derive(Debug, Clone, PartialEq)]
pub struct Executable {
    /// Role within the package.
    pub kind: ExecutableKind,
    /// Hardware batch size: inferences per run.
    pub batch_size: u32,
    /// Scratch bytes the instruction stream assumes.
    pub scratch_size_bytes: u64,
    /// Compiler estimate of run time in device cycles.
    pub estimated_cycles: i64,
    /// Token grouping executables whose cached parameters may coexist.
    /// 0 means the parameters cannot coexist with any other model's.
    pub parameter_caching_token: u64,
    /// Raw parameter blob.
    pub parameters: Vec<u8>,
    /// Input layer metadata, wire order.
    pub input_layers: Vec<LayerInfo>,
    /// Output layer metadata, wire order.
    pub output_layers: Vec<LayerInfo>,
    /// Instruction bitstream chunks with patch points.
    pub instruction_chunks: Vec<InstructionChunk>,
    /// Ordered DMA hints.
    pub dma_hints: Vec<DmaHint>,
    /// True when `dma_hints` describes every transfer the hardware will
    /// perform, in order.
    pub fully_deterministic: bool,
}

impl Executable {
    /// Looks up an input layer by name.
    pub fn input_layer(&self, name: &str) -> Option<&LayerInfo> {
        self.input_layers.iter().find(|layer| layer.name == name)
    }

    /// Looks up an output layer by name.
    pub fn output_layer(&self, name: &str) -> Option<&LayerInfo> {
        self.output_layers.iter().find(|layer| layer.name == name)
    }
}

/// A parsed package.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    /// Client-assigned model identifier.
    pub model_identifier: String,
    /// Chip the package was compiled for.
    pub chip: Chip,
    /// The executables, wire order. Between one and three; combination
    /// validity is enforced by the registry.
    pub executables: Vec<Executable>,
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos.checked_add(len).ok_or(ParseError::Truncated)?;
        if end > self.data.len() {
            return Err(ParseError::Truncated);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, ParseError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, ParseError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, ParseError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, ParseError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32, ParseError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, ParseError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_string(&mut self) -> Result<String, ParseError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| ParseError::BadString)
    }

    fn read_u32_table(&mut self) -> Result<Vec<u32>, ParseError> {
        let len = self.read_u32()? as usize;
        let mut table = Vec::with_capacity(len.min(self.data.len() / 4 + 1));
        for _ in 0..len {
            table.push(self.read_u32()?);
        }
        Ok(table)
    }
}

fn check_table(
    table: &'static str,
    entries: &[u32],
    expected: usize,
) -> Result<(), ParseError> {
    if entries.len() != expected {
        return Err(ParseError::TableLength {
            table,
            expected,
            actual: entries.len(),
        });
    }
    Ok(())
}

fn parse_output_layout(
    reader: &mut Reader<'_>,
    y_dim: usize,
    x_dim: usize,
) -> Result<OutputLayout, ParseError> {
    let layout = OutputLayout {
        y_tile_id: reader.read_u32_table()?,
        y_local_offset: reader.read_u32_table()?,
        x_tile_id: reader.read_u32_table()?,
        x_local_byte_offset: reader.read_u32_table()?,
        x_local_y_row_size: reader.read_u32_table()?,
        tile_byte_offset: reader.read_u32_table()?,
    };
    check_table("y_tile_id", &layout.y_tile_id, y_dim)?;
    check_table("y_local_offset", &layout.y_local_offset, y_dim)?;
    check_table("x_tile_id", &layout.x_tile_id, x_dim)?;
    check_table("x_local_byte_offset", &layout.x_local_byte_offset, x_dim)?;
    check_table("x_local_y_row_size", &layout.x_local_y_row_size, x_dim)?;

    // Every reachable linearized tile id needs a byte offset.
    let max_y_tile = layout.y_tile_id.iter().max().copied().unwrap_or(0);
    let max_x_tile = layout.x_tile_id.iter().max().copied().unwrap_or(0);
    let needed = (max_y_tile + max_x_tile) as usize + 1;
    if layout.tile_byte_offset.len() < needed {
        return Err(ParseError::TableLength {
            table: "tile_byte_offset",
            expected: needed,
            actual: layout.tile_byte_offset.len(),
        });
    }
    Ok(layout)
}

fn parse_shape_info(reader: &mut Reader<'_>) -> Result<Vec<SliceLayout>, ParseError> {
    let count = reader.read_u32()? as usize;
    let mut slices = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let mut dimension = [DimRange { start: 0, end: 0 }; NUM_DIMENSIONS];
        for range in &mut dimension {
            range.start = reader.read_i32()?;
            range.end = reader.read_i32()?;
        }
        let mut stride = [0i64; NUM_DIMENSIONS];
        for entry in &mut stride {
            *entry = reader.read_i64()?;
        }
        let offset_bytes = reader.read_u32()?;
        slices.push(SliceLayout {
            layout: TensorLayout {
                shape: TensorShape { dimension },
                stride,
            },
            offset_bytes,
        });
    }
    Ok(slices)
}

fn parse_layer(reader: &mut Reader<'_>) -> Result<LayerInfo, ParseError> {
    let name = reader.read_string()?;
    let data_type_raw = reader.read_u32()?;
    let data_type = DataType::from_wire(data_type_raw).ok_or(ParseError::UnknownEnum {
        what: "data type",
        value: data_type_raw,
    })?;
    let batch_dim = reader.read_u32()?;
    let y_dim = reader.read_u32()?;
    let x_dim = reader.read_u32()?;
    let z_dim = reader.read_u32()?;
    let execution_count_per_inference = reader.read_u32()?;
    let size_bytes_per_iteration = reader.read_u32()?;
    let zero_point = reader.read_i32()?;
    let dequantization_factor = reader.read_f32()?;
    let cache_on_dram = reader.read_u8()? != 0;
    let output_layout = if reader.read_u8()? != 0 {
        Some(parse_output_layout(reader, y_dim as usize, x_dim as usize)?)
    } else {
        None
    };
    let shape_info = parse_shape_info(reader)?;
    Ok(LayerInfo {
        name,
        data_type,
        batch_dim,
        y_dim,
        x_dim,
        z_dim,
        execution_count_per_inference,
        size_bytes_per_iteration,
        zero_point,
        dequantization_factor,
        cache_on_dram,
        output_layout,
        shape_info,
    })
}

fn parse_layers(reader: &mut Reader<'_>) -> Result<Vec<LayerInfo>, ParseError> {
    let count = reader.read_u32()? as usize;
    let mut layers = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        layers.push(parse_layer(reader)?);
    }
    Ok(layers)
}

fn parse_field_offset(reader: &mut Reader<'_>) -> Result<FieldOffset, ParseError> {
    let kind_raw = reader.read_u32()?;
    let kind = FieldOffsetKind::from_wire(kind_raw).ok_or(ParseError::UnknownEnum {
        what: "field offset kind",
        value: kind_raw,
    })?;
    let name = reader.read_string()?;
    let batch = reader.read_u32()?;
    let bit_offset = reader.read_u32()?;
    Ok(FieldOffset {
        kind,
        name,
        batch,
        bit_offset,
    })
}

fn parse_instruction_chunks(reader: &mut Reader<'_>) -> Result<Vec<InstructionChunk>, ParseError> {
    let count = reader.read_u32()? as usize;
    let mut chunks = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let bitstream = reader.read_bytes()?;
        let offset_count = reader.read_u32()? as usize;
        let mut field_offsets = Vec::with_capacity(offset_count.min(4096));
        for _ in 0..offset_count {
            field_offsets.push(parse_field_offset(reader)?);
        }
        chunks.push(InstructionChunk {
            bitstream,
            field_offsets,
        });
    }
    Ok(chunks)
}

fn parse_dma_hint(reader: &mut Reader<'_>) -> Result<DmaHint, ParseError> {
    let tag = reader.read_u32()?;
    match tag {
        0 => {
            let target_raw = reader.read_u32()?;
            let target = match target_raw {
                0 => DmaHintTarget::InputActivation,
                1 => DmaHintTarget::OutputActivation,
                2 => DmaHintTarget::Parameter,
                3 => DmaHintTarget::Scratch,
                value => {
                    return Err(ParseError::UnknownEnum {
                        what: "descriptor hint target",
                        value,
                    });
                }
            };
            let direction = match reader.read_u32()? {
                0 => FeedDirection::Infeed,
                1 => FeedDirection::Outfeed,
                value => {
                    return Err(ParseError::UnknownEnum {
                        what: "descriptor hint direction",
                        value,
                    });
                }
            };
            let name = reader.read_string()?;
            let batch = reader.read_u32()?;
            let offset = reader.read_u64()?;
            let size = reader.read_u64()?;
            Ok(DmaHint::Descriptor {
                target,
                direction,
                name,
                batch,
                offset,
                size,
            })
        }
        1 => Ok(DmaHint::Instruction {
            chunk_index: reader.read_u32()?,
        }),
        2 => {
            let id = reader.read_u32()?;
            if id > 3 {
                return Err(ParseError::UnknownEnum {
                    what: "interrupt hint id",
                    value: id,
                });
            }
            Ok(DmaHint::Interrupt { id })
        }
        3 => Ok(DmaHint::LocalFence),
        value => Err(ParseError::UnknownEnum {
            what: "dma hint",
            value,
        }),
    }
}

fn parse_executable(reader: &mut Reader<'_>) -> Result<Executable, ParseError> {
    let kind_raw = reader.read_u32()?;
    let kind = ExecutableKind::from_wire(kind_raw).ok_or(ParseError::UnknownEnum {
        what: "executable kind",
        value: kind_raw,
    })?;
    let batch_size = reader.read_u32()?;
    let scratch_size_bytes = reader.read_u64()?;
    let estimated_cycles = reader.read_i64()?;
    let parameter_caching_token = reader.read_u64()?;
    let parameters = reader.read_bytes()?;
    let input_layers = parse_layers(reader)?;
    let output_layers = parse_layers(reader)?;
    let instruction_chunks = parse_instruction_chunks(reader)?;
    let fully_deterministic = reader.read_u8()? != 0;
    let hint_count = reader.read_u32()? as usize;
    let mut dma_hints = Vec::with_capacity(hint_count.min(4096));
    for _ in 0..hint_count {
        dma_hints.push(parse_dma_hint(reader)?);
    }
    Ok(Executable {
        kind,
        batch_size,
        scratch_size_bytes,
        estimated_cycles,
        parameter_caching_token,
        parameters,
        input_layers,
        output_layers,
        instruction_chunks,
        dma_hints,
        fully_deterministic,
    })
}

/// Parses a serialized package.
pub fn parse_package(bytes: &[u8]) -> Result<Package, ParseError> {
    let mut reader = Reader::new(bytes);

    let magic: [u8; 4] = reader.take(4)?.try_into().unwrap();
    if magic != PACKAGE_MAGIC {
        return Err(ParseError::BadMagic(magic));
    }
    let version = reader.read_u32()?;
    if version != PACKAGE_VERSION {
        return Err(ParseError::UnsupportedVersion(version));
    }
    let chip = Chip::from_wire(reader.read_u32()?);
    let model_identifier = reader.read_string()?;

    let executable_count = reader.read_u32()? as usize;
    if executable_count == 0 {
        return Err(ParseError::BadExecutableSet("package holds no executables"));
    }
    if executable_count > 3 {
        return Err(ParseError::BadExecutableSet(
            "package holds more than three executables",
        ));
    }
    let mut executables = Vec::with_capacity(executable_count);
    for _ in 0..executable_count {
        executables.push(parse_executable(&mut reader)?);
    }

    log::trace!(
        "parsed package \"{model_identifier}\" with {} executables",
        executables.len()
    );
    Ok(Package {
        model_identifier,
        chip,
        executables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{ExecutableBuilder, LayerBuilder, PackageBuilder};

    #[test]
    fn bad_magic_is_rejected() {
        let err = parse_package(b"NOPE\x01\x00\x00\x00").unwrap_err();
        assert_eq!(err, ParseError::BadMagic(*b"NOPE"));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = PackageBuilder::new("m", Chip::A1)
            .executable(
                ExecutableBuilder::new(ExecutableKind::Standalone, 1)
                    .instruction_chunk(vec![0u8; 16], Vec::new()),
            )
            .build();
        let err = parse_package(&bytes[..bytes.len() - 3]).unwrap_err();
        assert_eq!(err, ParseError::Truncated);
    }

    #[test]
    fn round_trip_preserves_fields() {
        let bytes = PackageBuilder::new("mobilenet", Chip::A1)
            .executable(
                ExecutableBuilder::new(ExecutableKind::Standalone, 4)
                    .scratch_size_bytes(1 << 16)
                    .estimated_cycles(123_456)
                    .parameter_caching_token(0x1234)
                    .parameters(vec![7u8; 64])
                    .input_layer(LayerBuilder::new("in", DataType::FixedPoint8, 1, 1, 3072))
                    .output_layer(LayerBuilder::new("out", DataType::FixedPoint8, 1, 1, 2048))
                    .instruction_chunk(
                        vec![0u8; 64],
                        vec![FieldOffset {
                            kind: FieldOffsetKind::Parameter,
                            name: String::new(),
                            batch: 0,
                            bit_offset: 96,
                        }],
                    )
                    .dma_hint(DmaHint::Instruction { chunk_index: 0 })
                    .dma_hint(DmaHint::Interrupt { id: 0 })
                    .fully_deterministic(true),
            )
            .build();

        let package = parse_package(&bytes).unwrap();
        assert_eq!(package.model_identifier, "mobilenet");
        assert_eq!(package.chip, Chip::A1);
        assert_eq!(package.executables.len(), 1);

        let executable = &package.executables[0];
        assert_eq!(executable.kind, ExecutableKind::Standalone);
        assert_eq!(executable.batch_size, 4);
        assert_eq!(executable.scratch_size_bytes, 1 << 16);
        assert_eq!(executable.estimated_cycles, 123_456);
        assert_eq!(executable.parameter_caching_token, 0x1234);
        assert_eq!(executable.parameters, vec![7u8; 64]);
        assert_eq!(executable.input_layers.len(), 1);
        assert_eq!(executable.input_layers[0].name, "in");
        assert_eq!(executable.output_layers[0].name, "out");
        assert_eq!(executable.instruction_chunks.len(), 1);
        assert_eq!(executable.instruction_chunks[0].field_offsets.len(), 1);
        assert_eq!(executable.dma_hints.len(), 2);
        assert!(executable.fully_deterministic);
    }

    #[test]
    fn empty_package_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&PACKAGE_MAGIC);
        bytes.extend_from_slice(&PACKAGE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&Chip::A1.to_wire().to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // empty identifier
        bytes.extend_from_slice(&0u32.to_le_bytes()); // zero executables
        assert!(matches!(
            parse_package(&bytes),
            Err(ParseError::BadExecutableSet(_))
        ));
    }
}
