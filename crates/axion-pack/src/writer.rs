//! Package serialization.
//!
//! Builders that emit the exact byte layout [`parse_package`] reads. Tests
//! use them to synthesize fixtures; tooling uses them to repackage
//! compiler output.
//!
//! [`parse_package`]: crate::parse::parse_package

use crate::format::{
    Chip, DataType, DmaHint, DmaHintTarget, ExecutableKind, FeedDirection, FieldOffset,
    InstructionChunk, PACKAGE_MAGIC, PACKAGE_VERSION,
};
use crate::layer::OutputLayout;
use crate::shape::SliceLayout;

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&u32::try_from(bytes.len()).unwrap().to_le_bytes());
    out.extend_from_slice(bytes);
}

fn put_string(out: &mut Vec<u8>, text: &str) {
    put_bytes(out, text.as_bytes());
}

fn put_u32_table(out: &mut Vec<u8>, table: &[u32]) {
    out.extend_from_slice(&u32::try_from(table.len()).unwrap().to_le_bytes());
    for entry in table {
        out.extend_from_slice(&entry.to_le_bytes());
    }
}

/// Builds one layer record.
#[derive(Debug, Clone)]
pub struct LayerBuilder {
    name: String,
    data_type: DataType,
    batch_dim: u32,
    y_dim: u32,
    x_dim: u32,
    z_dim: u32,
    execution_count: u32,
    size_bytes_per_iteration: u32,
    zero_point: i32,
    dequantization_factor: f32,
    cache_on_dram: bool,
    output_layout: Option<OutputLayout>,
    shape_info: Vec<SliceLayout>,
}

impl LayerBuilder {
    /// Starts a layer with the given name, element type and y/x/z extents.
    /// The per-iteration size defaults to the unpadded size.
    pub fn new(name: &str, data_type: DataType, y_dim: u32, x_dim: u32, z_dim: u32) -> Self {
        let dense = y_dim * x_dim * z_dim * data_type.size_bytes() as u32;
        Self {
            name: name.to_string(),
            data_type,
            batch_dim: 1,
            y_dim,
            x_dim,
            z_dim,
            execution_count: 1,
            size_bytes_per_iteration: dense,
            zero_point: 0,
            dequantization_factor: 1.0,
            cache_on_dram: false,
            output_layout: None,
            shape_info: Vec::new(),
        }
    }

    /// Sets the per-inference execution count.
    pub fn execution_count(mut self, count: u32) -> Self {
        self.execution_count = count;
        self
    }

    /// Overrides the padded byte size of one iteration.
    pub fn size_bytes_per_iteration(mut self, size: u32) -> Self {
        self.size_bytes_per_iteration = size;
        self
    }

    /// Sets quantization numerics.
    pub fn numerics(mut self, zero_point: i32, dequantization_factor: f32) -> Self {
        self.zero_point = zero_point;
        self.dequantization_factor = dequantization_factor;
        self
    }

    /// Requests on-device DRAM staging for this layer.
    pub fn cache_on_dram(mut self, cache: bool) -> Self {
        self.cache_on_dram = cache;
        self
    }

    /// Attaches output tile-layout tables.
    pub fn output_layout(mut self, layout: OutputLayout) -> Self {
        self.output_layout = Some(layout);
        self
    }

    /// Attaches per-slice shape information.
    pub fn shape_info(mut self, slices: Vec<SliceLayout>) -> Self {
        self.shape_info = slices;
        self
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_string(out, &self.name);
        out.extend_from_slice(&self.data_type.to_wire().to_le_bytes());
        out.extend_from_slice(&self.batch_dim.to_le_bytes());
        out.extend_from_slice(&self.y_dim.to_le_bytes());
        out.extend_from_slice(&self.x_dim.to_le_bytes());
        out.extend_from_slice(&self.z_dim.to_le_bytes());
        out.extend_from_slice(&self.execution_count.to_le_bytes());
        out.extend_from_slice(&self.size_bytes_per_iteration.to_le_bytes());
        out.extend_from_slice(&self.zero_point.to_le_bytes());
        out.extend_from_slice(&self.dequantization_factor.to_le_bytes());
        out.push(u8::from(self.cache_on_dram));
        match &self.output_layout {
            Some(layout) => {
                out.push(1);
                put_u32_table(out, &layout.y_tile_id);
                put_u32_table(out, &layout.y_local_offset);
                put_u32_table(out, &layout.x_tile_id);
                put_u32_table(out, &layout.x_local_byte_offset);
                put_u32_table(out, &layout.x_local_y_row_size);
                put_u32_table(out, &layout.tile_byte_offset);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&u32::try_from(self.shape_info.len()).unwrap().to_le_bytes());
        for slice in &self.shape_info {
            for range in &slice.layout.shape.dimension {
                out.extend_from_slice(&range.start.to_le_bytes());
                out.extend_from_slice(&range.end.to_le_bytes());
            }
            for stride in &slice.layout.stride {
                out.extend_from_slice(&stride.to_le_bytes());
            }
            out.extend_from_slice(&slice.offset_bytes.to_le_bytes());
        }
    }
}

/// Builds one executable record.
#[derive(Debug, Clone)]
pub struct ExecutableBuilder {
    kind: ExecutableKind,
    batch_size: u32,
    scratch_size_bytes: u64,
    estimated_cycles: i64,
    parameter_caching_token: u64,
    parameters: Vec<u8>,
    input_layers: Vec<LayerBuilder>,
    output_layers: Vec<LayerBuilder>,
    instruction_chunks: Vec<InstructionChunk>,
    dma_hints: Vec<DmaHint>,
    fully_deterministic: bool,
}

impl ExecutableBuilder {
    /// Starts an executable of the given kind and hardware batch size.
    pub fn new(kind: ExecutableKind, batch_size: u32) -> Self {
        Self {
            kind,
            batch_size,
            scratch_size_bytes: 0,
            estimated_cycles: 0,
            parameter_caching_token: 0,
            parameters: Vec::new(),
            input_layers: Vec::new(),
            output_layers: Vec::new(),
            instruction_chunks: Vec::new(),
            dma_hints: Vec::new(),
            fully_deterministic: false,
        }
    }

    /// Sets the scratch requirement in bytes.
    pub fn scratch_size_bytes(mut self, size: u64) -> Self {
        self.scratch_size_bytes = size;
        self
    }

    /// Sets the estimated cycle count.
    pub fn estimated_cycles(mut self, cycles: i64) -> Self {
        self.estimated_cycles = cycles;
        self
    }

    /// Sets the parameter-caching token.
    pub fn parameter_caching_token(mut self, token: u64) -> Self {
        self.parameter_caching_token = token;
        self
    }

    /// Sets the parameter blob.
    pub fn parameters(mut self, parameters: Vec<u8>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Appends an input layer.
    pub fn input_layer(mut self, layer: LayerBuilder) -> Self {
        self.input_layers.push(layer);
        self
    }

    /// Appends an output layer.
    pub fn output_layer(mut self, layer: LayerBuilder) -> Self {
        self.output_layers.push(layer);
        self
    }

    /// Appends an instruction chunk with its patch points.
    pub fn instruction_chunk(mut self, bitstream: Vec<u8>, offsets: Vec<FieldOffset>) -> Self {
        self.instruction_chunks.push(InstructionChunk {
            bitstream,
            field_offsets: offsets,
        });
        self
    }

    /// Appends a DMA hint.
    pub fn dma_hint(mut self, hint: DmaHint) -> Self {
        self.dma_hints.push(hint);
        self
    }

    /// Marks the hint list as covering every hardware transfer.
    pub fn fully_deterministic(mut self, deterministic: bool) -> Self {
        self.fully_deterministic = deterministic;
        self
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.kind.to_wire().to_le_bytes());
        out.extend_from_slice(&self.batch_size.to_le_bytes());
        out.extend_from_slice(&self.scratch_size_bytes.to_le_bytes());
        out.extend_from_slice(&self.estimated_cycles.to_le_bytes());
        out.extend_from_slice(&self.parameter_caching_token.to_le_bytes());
        put_bytes(out, &self.parameters);
        for layers in [&self.input_layers, &self.output_layers] {
            out.extend_from_slice(&u32::try_from(layers.len()).unwrap().to_le_bytes());
            for layer in layers {
                layer.encode(out);
            }
        }
        out.extend_from_slice(
            &u32::try_from(self.instruction_chunks.len())
                .unwrap()
                .to_le_bytes(),
        );
        for chunk in &self.instruction_chunks {
            put_bytes(out, &chunk.bitstream);
            out.extend_from_slice(
                &u32::try_from(chunk.field_offsets.len())
                    .unwrap()
                    .to_le_bytes(),
            );
            for offset in &chunk.field_offsets {
                out.extend_from_slice(&offset.kind.to_wire().to_le_bytes());
                put_string(out, &offset.name);
                out.extend_from_slice(&offset.batch.to_le_bytes());
                out.extend_from_slice(&offset.bit_offset.to_le_bytes());
            }
        }
        out.push(u8::from(self.fully_deterministic));
        out.extend_from_slice(&u32::try_from(self.dma_hints.len()).unwrap().to_le_bytes());
        for hint in &self.dma_hints {
            match hint {
                DmaHint::Descriptor {
                    target,
                    direction,
                    name,
                    batch,
                    offset,
                    size,
                } => {
                    out.extend_from_slice(&0u32.to_le_bytes());
                    let target_raw: u32 = match target {
                        DmaHintTarget::InputActivation => 0,
                        DmaHintTarget::OutputActivation => 1,
                        DmaHintTarget::Parameter => 2,
                        DmaHintTarget::Scratch => 3,
                    };
                    out.extend_from_slice(&target_raw.to_le_bytes());
                    let direction_raw: u32 = match direction {
                        FeedDirection::Infeed => 0,
                        FeedDirection::Outfeed => 1,
                    };
                    out.extend_from_slice(&direction_raw.to_le_bytes());
                    put_string(out, name);
                    out.extend_from_slice(&batch.to_le_bytes());
                    out.extend_from_slice(&offset.to_le_bytes());
                    out.extend_from_slice(&size.to_le_bytes());
                }
                DmaHint::Instruction { chunk_index } => {
                    out.extend_from_slice(&1u32.to_le_bytes());
                    out.extend_from_slice(&chunk_index.to_le_bytes());
                }
                DmaHint::Interrupt { id } => {
                    out.extend_from_slice(&2u32.to_le_bytes());
                    out.extend_from_slice(&id.to_le_bytes());
                }
                DmaHint::LocalFence => {
                    out.extend_from_slice(&3u32.to_le_bytes());
                }
            }
        }
    }
}

/// Builds a serialized package.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    model_identifier: String,
    chip: Chip,
    executables: Vec<ExecutableBuilder>,
}

impl PackageBuilder {
    /// Starts a package for the given model identifier and chip.
    pub fn new(model_identifier: &str, chip: Chip) -> Self {
        Self {
            model_identifier: model_identifier.to_string(),
            chip,
            executables: Vec::new(),
        }
    }

    /// Appends an executable.
    pub fn executable(mut self, executable: ExecutableBuilder) -> Self {
        self.executables.push(executable);
        self
    }

    /// Serializes the package.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&PACKAGE_MAGIC);
        out.extend_from_slice(&PACKAGE_VERSION.to_le_bytes());
        out.extend_from_slice(&self.chip.to_wire().to_le_bytes());
        put_string(&mut out, &self.model_identifier);
        out.extend_from_slice(&u32::try_from(self.executables.len()).unwrap().to_le_bytes());
        for executable in &self.executables {
            executable.encode(&mut out);
        }
        out
    }
}
