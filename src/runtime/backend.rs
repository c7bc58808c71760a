//! Module defining the abstract interface (trait) for unpooling operators.
//!
//! Buffers are flat, row-major and split into `(batch, channel)` slices. Each
//! input slice holds `input_volume` elements and each output slice holds
//! `output_volume` elements; the mask has the input's layout and stores, per
//! element, a flat index into the matching output slice.

use thiserror::Error;

/// Errors raised while executing an operator.
/// Shared by every operator implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Buffer '{buffer}' holds {actual} elements; the slice layout requires {expected}.")]
    BufferSizeMismatch {
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Mask value {value} at slice {slice}, position {position} is not a valid index \
             into an output slice of {volume} elements.")]
    MaskIndexOutOfBounds {
        slice: usize,
        position: usize,
        value: f32,
        volume: usize,
    },

    #[error("Zero-sized spatial volume (input {input_volume}, output {output_volume}).")]
    EmptyVolume {
        input_volume: usize,
        output_volume: usize,
    },

    #[error("Mask grid {mask_grid:?} does not cover the {input:?} input plane.")]
    MaskGridTooSmall {
        mask_grid: [usize; 2],
        input: [usize; 2],
    },

    #[error("No accelerated adapter is available: {0}")]
    AcceleratorUnavailable(String),

    #[error("Device error: {0}")]
    DeviceError(String),
}

/// Flat addressing of feature maps split into independent `(batch, channel)` slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceLayout {
    /// `num * channels`.
    pub num_slices: usize,
    /// Product of the input's spatial extents.
    pub input_volume: usize,
    /// Product of the unpooled spatial extents.
    pub output_volume: usize,
}

impl SliceLayout {
    pub fn new(
        num_slices: usize,
        input_volume: usize,
        output_volume: usize,
    ) -> Result<Self, RuntimeError> {
        if input_volume == 0 || output_volume == 0 {
            return Err(RuntimeError::EmptyVolume {
                input_volume,
                output_volume,
            });
        }
        Ok(Self {
            num_slices,
            input_volume,
            output_volume,
        })
    }

    /// Builds the layout from full `[num, channels, spatial...]` shapes.
    pub fn from_shapes(
        input_shape: &[usize],
        output_shape: &[usize],
    ) -> Result<Self, RuntimeError> {
        let num_slices = input_shape.iter().take(2).product();
        let input_volume = input_shape.iter().skip(2).product();
        let output_volume = output_shape.iter().skip(2).product();
        Self::new(num_slices, input_volume, output_volume)
    }

    /// Element count of the input, mask and bottom gradient.
    pub fn input_len(&self) -> usize {
        self.num_slices * self.input_volume
    }

    /// Element count of the output and top gradient.
    pub fn output_len(&self) -> usize {
        self.num_slices * self.output_volume
    }

    pub fn input_offset(&self, slice: usize) -> usize {
        slice * self.input_volume
    }

    pub fn output_offset(&self, slice: usize) -> usize {
        slice * self.output_volume
    }

    pub(crate) fn check_len(
        &self,
        buffer: &'static str,
        actual: usize,
        expected: usize,
    ) -> Result<(), RuntimeError> {
        if actual != expected {
            return Err(RuntimeError::BufferSizeMismatch {
                buffer,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Converts mask values into checked per-slice output indices.
///
/// Values are truncated toward zero like an integer cast; negative, non-finite
/// or too-large values are rejected instead of addressing outside the slice.
pub fn resolve_mask(layout: &SliceLayout, mask: &[f32]) -> Result<Vec<usize>, RuntimeError> {
    layout.check_len("mask", mask.len(), layout.input_len())?;
    mask.iter()
        .enumerate()
        .map(|(flat, &value)| {
            let index = value.trunc();
            if value.is_finite() && index >= 0.0 && (index as usize) < layout.output_volume {
                Ok(index as usize)
            } else {
                Err(RuntimeError::MaskIndexOutOfBounds {
                    slice: flat / layout.input_volume,
                    position: flat % layout.input_volume,
                    value,
                    volume: layout.output_volume,
                })
            }
        })
        .collect()
}

/// Common interface of the unpooling execution paths.
///
/// Implementations are selected once per layer (see [`crate::runtime::instantiate`])
/// and then reused for every forward/backward call.
pub trait UnpoolingOperator: std::fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Scatter: zeroes `output`, then writes every input element to the
    /// output position recorded by the mask. The last write wins.
    fn forward(
        &self,
        layout: &SliceLayout,
        input: &[f32],
        mask: &[f32],
        output: &mut [f32],
    ) -> Result<(), RuntimeError>;

    /// Gather: every bottom gradient element reads the top gradient at the
    /// position recorded by the mask.
    fn backward(
        &self,
        layout: &SliceLayout,
        top_diff: &[f32],
        mask: &[f32],
        bottom_diff: &mut [f32],
    ) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_from_shapes() {
        let layout = SliceLayout::from_shapes(&[2, 3, 2, 2], &[2, 3, 4, 4]).unwrap();
        assert_eq!(layout.num_slices, 6);
        assert_eq!(layout.input_volume, 4);
        assert_eq!(layout.output_volume, 16);
        assert_eq!(layout.input_len(), 24);
        assert_eq!(layout.output_len(), 96);
        assert_eq!(layout.input_offset(2), 8);
        assert_eq!(layout.output_offset(2), 32);
    }

    #[test]
    fn test_layout_rejects_empty_volume() {
        assert!(matches!(
            SliceLayout::new(1, 0, 4),
            Err(RuntimeError::EmptyVolume { .. })
        ));
    }

    #[test]
    fn test_resolve_mask_truncates() {
        let layout = SliceLayout::new(2, 2, 4).unwrap();
        let indices = resolve_mask(&layout, &[0.0, 3.0, 1.9, 2.0]).unwrap();
        assert_eq!(indices, vec![0, 3, 1, 2]);
    }

    #[test]
    fn test_resolve_mask_reports_bad_entries() {
        let layout = SliceLayout::new(2, 2, 4).unwrap();
        assert_eq!(
            resolve_mask(&layout, &[0.0, 1.0, 4.0, 2.0]),
            Err(RuntimeError::MaskIndexOutOfBounds {
                slice: 1,
                position: 0,
                value: 4.0,
                volume: 4,
            })
        );
        assert!(resolve_mask(&layout, &[0.0, -1.0, 0.0, 0.0]).is_err());
        assert!(resolve_mask(&layout, &[f32::NAN, 0.0, 0.0, 0.0]).is_err());
        assert!(matches!(
            resolve_mask(&layout, &[0.0; 3]),
            Err(RuntimeError::BufferSizeMismatch { buffer: "mask", .. })
        ));
    }
}
