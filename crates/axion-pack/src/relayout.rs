//! Output re-layout, sign transform and input scatter.
//!
//! The accelerator writes output activations tile-major (tile, then local y,
//! then x, then z) while callers expect row-major y-x-z. [`relayout`] undoes
//! the tile order using the layer's layout tables, with fast paths for the
//! shapes that need no rework. [`transform_signed`] flips the sign bit of
//! fixed-point tensors in place, and [`scatter_input`] spreads iterative
//! inputs into their padded per-execution slots.

use axion_api::{Error, Result};

use crate::layer::LayerInfo;
use crate::shape::{self, TensorLayout, TensorShape};

/// Returns true when the hardware output stream of `layer` differs from the
/// packed row-major layout.
///
/// Without shape information the answer is conservatively true; with it, a
/// single unpadded slice is the only packed case.
pub fn needs_relayout(layer: &LayerInfo) -> bool {
    if layer.shape_info.is_empty() {
        return true;
    }
    layer.shape_info.len() > 1 || !layer.shape_info[0].layout.is_packed()
}

/// Copies one inference's worth of output from the hardware stream `src`
/// into the caller's row-major `dest`.
pub fn relayout(layer: &LayerInfo, dest: &mut [u8], src: &[u8]) -> Result<()> {
    let data_type_size = layer.data_type_size();
    let z_bytes = layer.z_dim as usize * data_type_size;
    let executions = layer.execution_count_per_inference as usize;

    if executions == 1 {
        if !needs_relayout(layer) {
            let len = layer.batch_dim as usize
                * layer.y_dim as usize
                * layer.x_dim as usize
                * z_bytes;
            dest[..len].copy_from_slice(&src[..len]);
            return Ok(());
        }
        if !layer.shape_info.is_empty() {
            return relayout_with_shape_information(layer, dest, src);
        }
    } else if layer.padded_size_bytes() == layer.actual_size_bytes() && !needs_relayout(layer) {
        let len = layer.actual_size_bytes();
        dest[..len].copy_from_slice(&src[..len]);
        return Ok(());
    }

    if layer.y_dim == 1 && layer.x_dim == 1 {
        // One dimensional output (z only); strip the padding that trails
        // each execution.
        let padded_size_bytes = layer.padded_size_bytes();
        let actual_size_bytes = layer.actual_size_bytes();
        if executions == 1 || padded_size_bytes == actual_size_bytes {
            let len = z_bytes * executions;
            dest[..len].copy_from_slice(&src[..len]);
        } else {
            let pad_per_execution = (padded_size_bytes - actual_size_bytes) / executions;
            let mut src_offset = 0;
            let mut dst_offset = 0;
            for _ in 0..executions {
                dest[dst_offset..dst_offset + z_bytes]
                    .copy_from_slice(&src[src_offset..src_offset + z_bytes]);
                dst_offset += z_bytes;
                src_offset += z_bytes + pad_per_execution;
            }
        }
        return Ok(());
    }

    relayout_tiled(layer, dest, src)
}

/// The general tiled path: walk y rows, copy the x stripe owned by each
/// tile, strip per-element z padding when present.
fn relayout_tiled(layer: &LayerInfo, dest: &mut [u8], src: &[u8]) -> Result<()> {
    let layout = layer.output_layout.as_ref().ok_or_else(|| {
        Error::internal(format!(
            "output layer \"{}\" needs re-layout but carries no layout tables",
            layer.name
        ))
    })?;

    let data_type_size = layer.data_type_size();
    let z_bytes = layer.z_dim as usize * data_type_size;
    let y_dim = layer.y_dim as usize;
    let x_dim = layer.x_dim as usize;

    // Padded z size comes from the distance between two neighbouring
    // elements of the stream.
    let z_bytes_padded = if x_dim > 1 {
        layer.buffer_index_yxz(0, 1, 0) - layer.buffer_index_yxz(0, 0, 0)
    } else {
        layer.buffer_index_yxz(1, 0, 0) - layer.buffer_index_yxz(0, 0, 0)
    } * data_type_size;

    // Contiguous x runs owned by one tile.
    let mut active_tile_x_sizes = Vec::new();
    let mut last_x = 0usize;
    let mut last_x_tile = layout.x_tile_id[0];
    for x in 1..x_dim {
        let cur_x_tile = layout.x_tile_id[x];
        if cur_x_tile != last_x_tile {
            active_tile_x_sizes.push(x - last_x);
            last_x_tile = cur_x_tile;
            last_x = x;
        }
    }
    active_tile_x_sizes.push(x_dim - last_x);

    if z_bytes != z_bytes_padded {
        match z_bytes {
            // Grayscale and RGB hot paths.
            1 => copy_stripes::<1>(layer, &active_tile_x_sizes, dest, src, z_bytes_padded),
            3 => copy_stripes::<3>(layer, &active_tile_x_sizes, dest, src, z_bytes_padded),
            _ => copy_stripes::<0>(layer, &active_tile_x_sizes, dest, src, z_bytes_padded),
        }
        return Ok(());
    }

    // No z padding. If everything came from a single tile the stream is
    // already in order.
    let first_y_tile = layout.y_tile_id[0];
    let last_y_tile = layout.y_tile_id[y_dim - 1];
    let executions = layer.execution_count_per_inference as usize;
    if active_tile_x_sizes.len() > 1 || first_y_tile != last_y_tile {
        if executions != 1 {
            return Err(Error::unimplemented(
                "tiled re-layout of multi-execution outputs",
            ));
        }
        let mut dst_offset = 0;
        for y in 0..y_dim {
            let y_index = layer.y_buffer_index(y);
            let mut tile_starting_x = 0usize;
            for tile_x_size in &active_tile_x_sizes {
                let src_offset =
                    layer.buffer_index(&y_index, tile_starting_x, 0) * data_type_size;
                let stripe = z_bytes * tile_x_size;
                dest[dst_offset..dst_offset + stripe]
                    .copy_from_slice(&src[src_offset..src_offset + stripe]);
                dst_offset += stripe;
                tile_starting_x += tile_x_size;
            }
        }
    } else {
        let len = x_dim * y_dim * z_bytes * executions;
        dest[..len].copy_from_slice(&src[..len]);
    }
    Ok(())
}

/// Copies x stripes element by element, stripping z padding. `Z` selects a
/// compile-time specialised inner copy; `Z = 0` falls back to the dynamic
/// width.
fn copy_stripes<const Z: usize>(
    layer: &LayerInfo,
    active_tile_x_sizes: &[usize],
    dest: &mut [u8],
    src: &[u8],
    z_bytes_padded: usize,
) {
    let data_type_size = layer.data_type_size();
    let z_bytes = if Z == 0 {
        layer.z_dim as usize * data_type_size
    } else {
        Z
    };

    let mut dst_offset = 0usize;
    for y in 0..layer.y_dim as usize {
        let y_index = layer.y_buffer_index(y);
        let mut tile_starting_x = 0usize;
        for tile_x_size in active_tile_x_sizes {
            let mut src_offset = layer.buffer_index(&y_index, tile_starting_x, 0) * data_type_size;
            for _ in 0..*tile_x_size {
                if Z == 1 {
                    dest[dst_offset] = src[src_offset];
                } else if Z == 3 {
                    dest[dst_offset] = src[src_offset];
                    dest[dst_offset + 1] = src[src_offset + 1];
                    dest[dst_offset + 2] = src[src_offset + 2];
                } else {
                    dest[dst_offset..dst_offset + z_bytes]
                        .copy_from_slice(&src[src_offset..src_offset + z_bytes]);
                }
                dst_offset += z_bytes;
                src_offset += z_bytes_padded;
            }
            tile_starting_x += tile_x_size;
        }
    }
}

/// Shape-information path: copy each source slice into the packed
/// destination through the N-D shape copier.
fn relayout_with_shape_information(layer: &LayerInfo, dest: &mut [u8], src: &[u8]) -> Result<()> {
    if layer.execution_count_per_inference != 1 {
        return Err(Error::unimplemented(
            "shape-information re-layout of multi-execution outputs",
        ));
    }

    let data_type_size = layer.data_type_size();
    for (index, slice) in layer.shape_info.iter().enumerate() {
        if !slice.layout.is_valid() {
            return Err(Error::failed_precondition(format!(
                "invalid layout for output slice {index} of layer \"{}\"",
                layer.name
            )));
        }
        if slice.offset_bytes as usize % data_type_size != 0 {
            return Err(Error::failed_precondition(format!(
                "slice offset {} is not aligned to the element size {}",
                slice.offset_bytes, data_type_size
            )));
        }
    }

    let dest_shape = TensorShape::from_dims(
        layer.batch_dim as i32,
        layer.y_dim as i32,
        layer.x_dim as i32,
        layer.z_dim as i32,
    );
    let dest_layout = TensorLayout::packed(dest_shape);

    for slice in &layer.shape_info {
        let slice_src = &src[slice.offset_bytes as usize..];
        shape::copy_shape(
            &slice.layout.shape,
            &slice.layout,
            slice_src,
            &dest_layout,
            dest,
            data_type_size,
            shape::BATCH,
        );
    }
    Ok(())
}

/// Flips the most significant bit of every element in place, converting
/// between the signed and unsigned fixed-point representations.
///
/// Applies to fixed-point 8/16 layers only; the caller checks
/// [`LayerInfo::signed_data_type`] first. Elements are little-endian, so the
/// MSB lives in the last byte of each element.
pub fn transform_signed(layer: &LayerInfo, buffer: &mut [u8]) -> Result<()> {
    let data_type_size = layer.data_type_size();
    if buffer.len() < layer.actual_size_bytes() {
        return Err(Error::invalid_argument(format!(
            "buffer of {} bytes is smaller than the layer's {} actual bytes",
            buffer.len(),
            layer.actual_size_bytes()
        )));
    }

    let mut index = 0usize;
    for _ in 0..layer.num_elements() {
        let msb = index + data_type_size - 1;
        buffer[msb] ^= 0x80;
        index += data_type_size;
    }
    Ok(())
}

/// Spreads an iterative input into padded per-execution slots.
///
/// `src` holds `executions` back-to-back iterations of actual data; `dest`
/// receives them at padded stride. Bytes between iterations keep their
/// existing contents.
pub fn scatter_input(layer: &LayerInfo, dest: &mut [u8], src: &[u8]) -> Result<()> {
    let executions = layer.execution_count_per_inference as usize;
    let padded_per_execution = layer.padded_size_bytes() / executions;
    let actual_per_execution = layer.actual_size_bytes() / executions;
    if dest.len() < layer.padded_size_bytes() {
        return Err(Error::invalid_argument(
            "scatter destination is smaller than the padded layer size",
        ));
    }
    for iteration in 0..executions {
        let src_offset = iteration * actual_per_execution;
        let dst_offset = iteration * padded_per_execution;
        dest[dst_offset..dst_offset + actual_per_execution]
            .copy_from_slice(&src[src_offset..src_offset + actual_per_execution]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DataType;
    use crate::layer::OutputLayout;
    use crate::shape::{DimRange, SliceLayout};
    use proptest::prelude::*;

    fn layer(y: u32, x: u32, z: u32, data_type: DataType) -> LayerInfo {
        LayerInfo {
            name: "out".to_string(),
            data_type,
            batch_dim: 1,
            y_dim: y,
            x_dim: x,
            z_dim: z,
            execution_count_per_inference: 1,
            size_bytes_per_iteration: y * x * z * data_type.size_bytes() as u32,
            zero_point: 0,
            dequantization_factor: 1.0,
            cache_on_dram: false,
            output_layout: None,
            shape_info: Vec::new(),
        }
    }

    /// Two tiles split the x dimension; each tile stores its rows padded to
    /// four bytes of z.
    fn two_tile_layer() -> LayerInfo {
        let mut info = layer(2, 4, 3, DataType::FixedPoint8);
        info.output_layout = Some(OutputLayout {
            y_tile_id: vec![0, 0],
            y_local_offset: vec![0, 1],
            x_tile_id: vec![0, 0, 1, 1],
            x_local_byte_offset: vec![0, 4, 0, 4],
            x_local_y_row_size: vec![8, 8, 8, 8],
            tile_byte_offset: vec![0, 16],
        });
        info
    }

    #[test]
    fn one_dimensional_strips_execution_padding() {
        let mut info = layer(1, 1, 4, DataType::FixedPoint8);
        info.execution_count_per_inference = 2;
        info.size_bytes_per_iteration = 6; // 4 actual + 2 pad per iteration
        let src = [1, 2, 3, 4, 0xEE, 0xEE, 5, 6, 7, 8, 0xEE, 0xEE];
        let mut dest = [0u8; 8];
        relayout(&info, &mut dest, &src).unwrap();
        assert_eq!(dest, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn tiled_path_strips_z_padding_across_tiles() {
        let info = two_tile_layer();
        // Stream: tile 0 holds x 0..2, tile 1 holds x 2..4; rows padded to
        // 4 bytes of z per element.
        let mut src = vec![0u8; 32];
        for y in 0..2 {
            for x in 0..4usize {
                let tile = x / 2;
                let local_x = x % 2;
                let base = tile * 16 + y * 8 + local_x * 4;
                for z in 0..3 {
                    src[base + z] = (y * 12 + x * 3 + z + 1) as u8;
                }
            }
        }
        let mut dest = vec![0u8; 24];
        relayout(&info, &mut dest, &src).unwrap();
        assert_eq!(dest, (1..=24).collect::<Vec<u8>>());
    }

    #[test]
    fn packed_shape_info_takes_memcpy_path() {
        let mut info = layer(2, 2, 2, DataType::FixedPoint8);
        let shape = TensorShape::from_dims(1, 2, 2, 2);
        info.shape_info = vec![SliceLayout {
            layout: TensorLayout::packed(shape),
            offset_bytes: 0,
        }];
        assert!(!needs_relayout(&info));
        let src: Vec<u8> = (1..=8).collect();
        let mut dest = vec![0u8; 8];
        relayout(&info, &mut dest, &src).unwrap();
        assert_eq!(dest, src);
    }

    #[test]
    fn shape_info_slices_merge_into_destination() {
        // y split into two slices of one row each, stored back to back.
        let mut info = layer(2, 2, 2, DataType::FixedPoint8);
        let row = |y: i32| TensorShape {
            dimension: [
                DimRange { start: 0, end: 0 },
                DimRange { start: y, end: y },
                DimRange { start: 0, end: 1 },
                DimRange { start: 0, end: 1 },
            ],
        };
        info.shape_info = vec![
            SliceLayout {
                layout: TensorLayout {
                    shape: row(1),
                    stride: [4, 4, 2, 1],
                },
                offset_bytes: 0,
            },
            SliceLayout {
                layout: TensorLayout {
                    shape: row(0),
                    stride: [4, 4, 2, 1],
                },
                offset_bytes: 4,
            },
        ];
        assert!(needs_relayout(&info));
        // Stream: row y=1 first, then row y=0.
        let src = [5, 6, 7, 8, 1, 2, 3, 4];
        let mut dest = [0u8; 8];
        relayout(&info, &mut dest, &src).unwrap();
        assert_eq!(dest, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn scatter_places_iterations_at_padded_stride() {
        let mut info = layer(1, 1, 4, DataType::FixedPoint8);
        info.execution_count_per_inference = 2;
        info.size_bytes_per_iteration = 6;
        let src = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut dest = [0u8; 12];
        relayout_scatter_check(&info, &mut dest, &src);
        assert_eq!(dest, [1, 2, 3, 4, 0, 0, 5, 6, 7, 8, 0, 0]);
    }

    fn relayout_scatter_check(info: &LayerInfo, dest: &mut [u8], src: &[u8]) {
        scatter_input(info, dest, src).unwrap();
    }

    #[test]
    fn sign_transform_rejects_short_buffers() {
        let info = layer(1, 1, 16, DataType::SignedFixedPoint16);
        let mut buffer = vec![0u8; 8];
        assert!(transform_signed(&info, &mut buffer).is_err());
    }

    proptest! {
        #[test]
        fn sign_transform_is_an_involution(data in proptest::collection::vec(any::<u8>(), 32)) {
            let info = layer(1, 1, 16, DataType::SignedFixedPoint16);
            let mut buffer = data.clone();
            transform_signed(&info, &mut buffer).unwrap();
            prop_assert_ne!(&buffer, &data);
            transform_signed(&info, &mut buffer).unwrap();
            prop_assert_eq!(buffer, data);
        }

        #[test]
        fn sign_transform_only_touches_msbs(data in proptest::collection::vec(any::<u8>(), 32)) {
            let info = layer(1, 1, 16, DataType::SignedFixedPoint16);
            let mut buffer = data.clone();
            transform_signed(&info, &mut buffer).unwrap();
            for (index, (before, after)) in data.iter().zip(buffer.iter()).enumerate() {
                if index % 2 == 1 {
                    prop_assert_eq!(before ^ 0x80, *after);
                } else {
                    prop_assert_eq!(before, after);
                }
            }
        }
    }
}
