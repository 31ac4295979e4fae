//! Layer metadata: dimensions, numerics and the hardware output layout
//! tables used to undo tile-major ordering.

use crate::format::DataType;
use crate::shape::SliceLayout;

/// Tile-layout tables for an output layer.
///
/// The hardware emits outputs tile-major. These tables recover, for any
/// (y, x) coordinate, the byte position of the element inside the output
/// stream:
///
/// ```text
/// tile      = y_tile_id[y] + x_tile_id[x]
/// position  = tile_byte_offset[tile]
///           + y_local_offset[y] * x_local_y_row_size[x]
///           + x_local_byte_offset[x]
/// ```
///
/// positions are in data-type units; callers scale by the element size.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputLayout {
    /// y coordinate -> linearized tile id contribution.
    pub y_tile_id: Vec<u32>,
    /// y coordinate -> local row offset within the tile's output chunk.
    pub y_local_offset: Vec<u32>,
    /// x coordinate -> linearized tile id contribution.
    pub x_tile_id: Vec<u32>,
    /// x coordinate -> local byte offset within the tile row.
    pub x_local_byte_offset: Vec<u32>,
    /// x coordinate -> byte size of one local y row on the owning tile.
    pub x_local_y_row_size: Vec<u32>,
    /// linearized tile id -> byte offset of the tile's chunk in the stream.
    pub tile_byte_offset: Vec<u32>,
}

/// y-dependent part of an output buffer index, hoisted out of the x loop.
#[derive(Debug, Clone, Copy)]
pub struct YBufferIndex {
    /// Linearized tile id contribution for this y.
    pub y_linearized_tile_id: u32,
    /// Local row within the tile chunk for this y.
    pub local_y_coordinate: u32,
}

/// Metadata of one input or output layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerInfo {
    /// Layer name, unique within its direction.
    pub name: String,
    /// Element type.
    pub data_type: DataType,
    /// Batch extent. 1 unless the executable batches internally.
    pub batch_dim: u32,
    /// Y extent.
    pub y_dim: u32,
    /// X extent.
    pub x_dim: u32,
    /// Z extent.
    pub z_dim: u32,
    /// How many times the layer executes per inference.
    pub execution_count_per_inference: u32,
    /// Padded byte size of one execution's worth of data.
    pub size_bytes_per_iteration: u32,
    /// Quantization zero point.
    pub zero_point: i32,
    /// Quantization scale.
    pub dequantization_factor: f32,
    /// Whether activations of this layer should be staged in on-device DRAM.
    pub cache_on_dram: bool,
    /// Output tile-layout tables; `None` for inputs and packed outputs.
    pub output_layout: Option<OutputLayout>,
    /// Per-slice source layouts; empty when the executable does not supply
    /// shape information.
    pub shape_info: Vec<SliceLayout>,
}

impl LayerInfo {
    /// Size of one element in bytes.
    pub fn data_type_size(&self) -> usize {
        self.data_type.size_bytes()
    }

    /// True when the sign transform applies to this layer.
    ///
    /// 32-bit signed fixed point deliberately reports `false`: existing
    /// compiled models depend on the accelerator-side representation being
    /// passed through untouched.
    pub fn signed_data_type(&self) -> bool {
        matches!(
            self.data_type,
            DataType::SignedFixedPoint8 | DataType::SignedFixedPoint16
        )
    }

    /// Expected activation byte size excluding padding.
    pub fn actual_size_bytes(&self) -> usize {
        self.num_elements() * self.data_type_size() * self.execution_count_per_inference as usize
    }

    /// Expected activation byte size including per-iteration padding.
    pub fn padded_size_bytes(&self) -> usize {
        self.size_bytes_per_iteration as usize * self.execution_count_per_inference as usize
    }

    /// Elements per execution.
    pub fn num_elements(&self) -> usize {
        self.y_dim as usize * self.x_dim as usize * self.z_dim as usize
    }

    /// Returns the y-dependent part of the output buffer index.
    ///
    /// # Panics
    ///
    /// Panics when the layer carries no layout tables.
    pub fn y_buffer_index(&self, y: usize) -> YBufferIndex {
        let layout = self.output_layout.as_ref().expect("layer has no layout");
        YBufferIndex {
            y_linearized_tile_id: layout.y_tile_id[y],
            local_y_coordinate: layout.y_local_offset[y],
        }
    }

    /// Returns the output stream position (in data-type units) of element
    /// (y, x, z), given the hoisted y part.
    pub fn buffer_index(&self, y_index: &YBufferIndex, x: usize, z: usize) -> usize {
        let layout = self.output_layout.as_ref().expect("layer has no layout");
        let tile = (y_index.y_linearized_tile_id + layout.x_tile_id[x]) as usize;
        layout.tile_byte_offset[tile] as usize
            + y_index.local_y_coordinate as usize * layout.x_local_y_row_size[x] as usize
            + layout.x_local_byte_offset[x] as usize
            + z
    }

    /// Full output stream position of element (y, x, z).
    pub fn buffer_index_yxz(&self, y: usize, x: usize, z: usize) -> usize {
        self.buffer_index(&self.y_buffer_index(y), x, z)
    }
}
