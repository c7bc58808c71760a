//! Module implementing the reference CPU operator.
//!
//! Kernels walk `(batch, channel)` slices with explicit offsets into flat
//! row-major buffers. Iteration inside a slice is row-major, which fixes the
//! order of writes for the scatter.

use super::backend::{resolve_mask, RuntimeError, SliceLayout, UnpoolingOperator};
use crate::params::PoolGeometry2d;

/// Reference operator; always available.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuUnpooling;

impl CpuUnpooling {
    pub fn new() -> Self {
        Self
    }
}

impl UnpoolingOperator for CpuUnpooling {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn forward(
        &self,
        layout: &SliceLayout,
        input: &[f32],
        mask: &[f32],
        output: &mut [f32],
    ) -> Result<(), RuntimeError> {
        unpool_forward(layout, input, mask, output)
    }

    fn backward(
        &self,
        layout: &SliceLayout,
        top_diff: &[f32],
        mask: &[f32],
        bottom_diff: &mut [f32],
    ) -> Result<(), RuntimeError> {
        unpool_backward(layout, top_diff, mask, bottom_diff)
    }
}

/// Scatter every input element to `output[mask]` within its slice.
///
/// The whole mask is validated before `output` is touched.
pub fn unpool_forward(
    layout: &SliceLayout,
    input: &[f32],
    mask: &[f32],
    output: &mut [f32],
) -> Result<(), RuntimeError> {
    layout.check_len("input", input.len(), layout.input_len())?;
    layout.check_len("output", output.len(), layout.output_len())?;
    let targets = resolve_mask(layout, mask)?;

    output.fill(0.0);
    for slice in 0..layout.num_slices {
        let src = layout.input_offset(slice);
        let dst = layout.output_offset(slice);
        for index in 0..layout.input_volume {
            output[dst + targets[src + index]] = input[src + index];
        }
    }
    Ok(())
}

/// Gather `top_diff[mask]` back into every bottom gradient element.
pub fn unpool_backward(
    layout: &SliceLayout,
    top_diff: &[f32],
    mask: &[f32],
    bottom_diff: &mut [f32],
) -> Result<(), RuntimeError> {
    layout.check_len("top_diff", top_diff.len(), layout.output_len())?;
    layout.check_len("bottom_diff", bottom_diff.len(), layout.input_len())?;
    let sources = resolve_mask(layout, mask)?;

    bottom_diff.fill(0.0);
    for slice in 0..layout.num_slices {
        let dst = layout.input_offset(slice);
        let src = layout.output_offset(slice);
        for index in 0..layout.input_volume {
            bottom_diff[dst + index] = top_diff[src + sources[dst + index]];
        }
    }
    Ok(())
}

/// Spatial extents of one 2-D pooling plane and of the grid its mask indexes.
///
/// The mask grid is the unpooled map built from the pooled extents. It must
/// cover the input so every argmax keeps its `(h, w)` coordinates there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPlane {
    pub height: usize,
    pub width: usize,
    pub pooled_height: usize,
    pub pooled_width: usize,
    pub mask_height: usize,
    pub mask_width: usize,
}

impl PoolPlane {
    /// Plane whose mask grid is the input itself.
    pub fn new(height: usize, width: usize, pooled_height: usize, pooled_width: usize) -> Self {
        Self {
            height,
            width,
            pooled_height,
            pooled_width,
            mask_height: height,
            mask_width: width,
        }
    }

    pub fn with_mask_grid(mut self, mask_height: usize, mask_width: usize) -> Self {
        self.mask_height = mask_height;
        self.mask_width = mask_width;
        self
    }

    fn input_volume(&self) -> usize {
        self.height * self.width
    }

    fn pooled_volume(&self) -> usize {
        self.pooled_height * self.pooled_width
    }

    fn mask_volume(&self) -> usize {
        self.mask_height * self.mask_width
    }

    fn check_mask_grid(&self) -> Result<(), RuntimeError> {
        if self.mask_height < self.height || self.mask_width < self.width {
            return Err(RuntimeError::MaskGridTooSmall {
                mask_grid: [self.mask_height, self.mask_width],
                input: [self.height, self.width],
            });
        }
        Ok(())
    }
}

/// Max pooling that records, per pooled cell, the flat `h * mask_width + w`
/// index of the maximum. Ties keep the first max.
pub fn max_pool2d_forward(
    geometry: &PoolGeometry2d,
    plane: &PoolPlane,
    num_slices: usize,
    input: &[f32],
    output: &mut [f32],
    mask: &mut [f32],
) -> Result<(), RuntimeError> {
    plane.check_mask_grid()?;
    let in_volume = plane.input_volume();
    let out_volume = plane.pooled_volume();
    // The pooled side plays the "input" role of the unpooling layout.
    let layout = SliceLayout::new(num_slices, out_volume, in_volume)?;
    layout.check_len("input", input.len(), layout.output_len())?;
    layout.check_len("output", output.len(), layout.input_len())?;
    layout.check_len("mask", mask.len(), layout.input_len())?;

    let [kernel_h, kernel_w] = geometry.kernel();
    let [stride_h, stride_w] = geometry.stride();
    let [pad_h, pad_w] = geometry.pad();
    for slice in 0..num_slices {
        let src = &input[slice * in_volume..(slice + 1) * in_volume];
        let dst = slice * out_volume;
        for ph in 0..plane.pooled_height {
            let (h_start, h_end) = window(ph, stride_h, pad_h, kernel_h, plane.height);
            for pw in 0..plane.pooled_width {
                let (w_start, w_end) = window(pw, stride_w, pad_w, kernel_w, plane.width);
                let mut best = f32::NEG_INFINITY;
                let mut best_at = (h_start, w_start);
                for h in h_start..h_end {
                    for w in w_start..w_end {
                        let value = src[h * plane.width + w];
                        if value > best {
                            best = value;
                            best_at = (h, w);
                        }
                    }
                }
                let pool_index = dst + ph * plane.pooled_width + pw;
                output[pool_index] = best;
                mask[pool_index] = (best_at.0 * plane.mask_width + best_at.1) as f32;
            }
        }
    }
    Ok(())
}

/// Routes pooled gradients to the recorded argmax positions, accumulating
/// where overlapping windows share a maximum.
pub fn max_pool2d_backward(
    plane: &PoolPlane,
    num_slices: usize,
    top_diff: &[f32],
    mask: &[f32],
    bottom_diff: &mut [f32],
) -> Result<(), RuntimeError> {
    plane.check_mask_grid()?;
    let layout = SliceLayout::new(num_slices, plane.pooled_volume(), plane.mask_volume())?;
    let in_volume = plane.input_volume();
    layout.check_len("top_diff", top_diff.len(), layout.input_len())?;
    layout.check_len("bottom_diff", bottom_diff.len(), num_slices * in_volume)?;

    // Mask grid coordinates back to input offsets, all checked before writing.
    let targets = resolve_mask(&layout, mask)?
        .into_iter()
        .enumerate()
        .map(|(flat, index)| {
            let (h, w) = (index / plane.mask_width, index % plane.mask_width);
            if h < plane.height && w < plane.width {
                Ok(h * plane.width + w)
            } else {
                Err(RuntimeError::MaskIndexOutOfBounds {
                    slice: flat / layout.input_volume,
                    position: flat % layout.input_volume,
                    value: mask[flat],
                    volume: in_volume,
                })
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    bottom_diff.fill(0.0);
    for slice in 0..num_slices {
        let src = layout.input_offset(slice);
        let dst = slice * in_volume;
        for index in 0..layout.input_volume {
            bottom_diff[dst + targets[src + index]] += top_diff[src + index];
        }
    }
    Ok(())
}

/// Clipped `[start, end)` of the pooling window at `pooled_index`.
fn window(
    pooled_index: usize,
    stride: usize,
    pad: usize,
    kernel: usize,
    extent: usize,
) -> (usize, usize) {
    let start = (pooled_index * stride) as isize - pad as isize;
    let end = (start + kernel as isize).min(extent as isize);
    (start.max(0) as usize, end.max(0) as usize)
}
