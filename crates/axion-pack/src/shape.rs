//! Minimal 4-D tensor shape and layout arithmetic.
//!
//! Output layers may carry per-slice layout descriptions instead of tile
//! tables. A [`TensorLayout`] maps 4-D element positions (batch, y, x, z) to
//! linear element indices through per-dimension strides; a [`TensorShape`]
//! is an inclusive box of positions. The re-layout path copies each source
//! slice into the packed destination, taking whole contiguous runs when the
//! strides line up and recursing one dimension at a time when they do not.

/// Number of tensor dimensions.
pub const NUM_DIMENSIONS: usize = 4;

/// Dimension indices.
pub const BATCH: usize = 0;
/// Y dimension index.
pub const Y: usize = 1;
/// X dimension index.
pub const X: usize = 2;
/// Z dimension index.
pub const Z: usize = 3;

/// Inclusive range of positions along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimRange {
    /// First position.
    pub start: i32,
    /// Last position (inclusive).
    pub end: i32,
}

impl DimRange {
    /// Number of positions in the range.
    pub fn len(&self) -> i64 {
        i64::from(self.end) - i64::from(self.start) + 1
    }

    /// True when the range holds no positions. A valid range never is.
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// An inclusive 4-D box of element positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorShape {
    /// Per-dimension ranges, `[batch, y, x, z]`.
    pub dimension: [DimRange; NUM_DIMENSIONS],
}

impl TensorShape {
    /// A shape covering `[0, dim)` in every dimension.
    pub fn from_dims(batch: i32, y: i32, x: i32, z: i32) -> Self {
        let range = |n: i32| DimRange { start: 0, end: n - 1 };
        Self {
            dimension: [range(batch), range(y), range(x), range(z)],
        }
    }

    /// Number of elements in the box.
    pub fn num_elements(&self) -> i64 {
        self.dimension.iter().map(DimRange::len).product()
    }

    /// True when every range is non-empty.
    pub fn is_valid(&self) -> bool {
        self.dimension.iter().all(|range| !range.is_empty())
    }
}

/// Maps element positions to linear element indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorLayout {
    /// The box of positions this layout stores.
    pub shape: TensorShape,
    /// Per-dimension element strides.
    pub stride: [i64; NUM_DIMENSIONS],
}

impl TensorLayout {
    /// The packed (densely strided) layout of `shape`.
    pub fn packed(shape: TensorShape) -> Self {
        let mut stride = [1i64; NUM_DIMENSIONS];
        for dim in (0..NUM_DIMENSIONS - 1).rev() {
            stride[dim] = stride[dim + 1] * shape.dimension[dim + 1].len();
        }
        Self { shape, stride }
    }

    /// True when the layout packs its own shape with no padding elements.
    pub fn is_packed(&self) -> bool {
        *self == Self::packed(self.shape)
    }

    /// True when strides are positive and weakly ordered outermost-largest,
    /// which is what the copy routines require.
    pub fn is_valid(&self) -> bool {
        self.shape.is_valid()
            && self.stride.iter().all(|&s| s > 0)
            && self.stride.windows(2).all(|pair| pair[0] >= pair[1])
    }

    /// Linear element index of the first (lowest) position of `shape` under
    /// this layout. Positions are absolute; the layout's own base position
    /// maps to index 0.
    pub fn first_index_of(&self, shape: &TensorShape) -> i64 {
        shape
            .dimension
            .iter()
            .zip(self.shape.dimension.iter())
            .zip(self.stride.iter())
            .map(|((range, base), stride)| i64::from(range.start - base.start) * stride)
            .sum()
    }

    /// True when the elements of `shape` occupy one contiguous run under
    /// this layout.
    pub fn is_contiguous_for(&self, shape: &TensorShape) -> bool {
        let mut run = 1i64;
        for dim in (0..NUM_DIMENSIONS).rev() {
            let len = shape.dimension[dim].len();
            if len == 1 {
                continue;
            }
            if self.stride[dim] != run {
                return false;
            }
            run *= len;
        }
        true
    }
}

/// One source slice of an output layer: its layout plus the byte offset of
/// its first element within the hardware output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceLayout {
    /// Layout of the slice in the source stream.
    pub layout: TensorLayout,
    /// Byte offset of the slice within the stream.
    pub offset_bytes: u32,
}

/// Copies the elements of `source_shape` from `src` (laid out by
/// `source_layout`) into `dst` (laid out by `dest_layout`).
///
/// Whole contiguous runs are memcpy'd; otherwise the copy recurses one
/// dimension at a time starting at `dim`.
pub fn copy_shape(
    source_shape: &TensorShape,
    source_layout: &TensorLayout,
    src: &[u8],
    dest_layout: &TensorLayout,
    dst: &mut [u8],
    bytes_per_element: usize,
    dim: usize,
) {
    assert!(dim < NUM_DIMENSIONS);

    if source_layout.is_contiguous_for(source_shape) && dest_layout.is_contiguous_for(source_shape)
    {
        let src_offset = source_layout.first_index_of(source_shape) as usize * bytes_per_element;
        let dst_offset = dest_layout.first_index_of(source_shape) as usize * bytes_per_element;
        let len = source_shape.num_elements() as usize * bytes_per_element;
        dst[dst_offset..dst_offset + len].copy_from_slice(&src[src_offset..src_offset + len]);
        return;
    }

    let range = source_shape.dimension[dim];
    for position in range.start..=range.end {
        let mut slice = *source_shape;
        slice.dimension[dim] = DimRange {
            start: position,
            end: position,
        };
        copy_shape(
            &slice,
            source_layout,
            src,
            dest_layout,
            dst,
            bytes_per_element,
            dim + 1,
        );
    }
}
