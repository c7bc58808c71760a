//! Module for shape inference of the pooling and unpooling layers.
//!
//! Computes the output shape of a layer from its input shape and resolved
//! kernel/stride/pad. Unpooling must exactly invert the pooling reduction:
//! `unpooled = (input - 1) * stride + kernel - 2 * pad` per spatial axis.

use thiserror::Error;

/// Tensor shape.
pub type Shape = Vec<usize>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("expected {expected} axes (num, channels, spatial...), got {actual}.")]
    InvalidRank { expected: usize, actual: usize },

    #[error("Spatial axis {axis} collapses: input {input}, kernel {kernel}, stride {stride}, \
             pad {pad} give no positive unpooled extent.")]
    DegenerateExtent {
        axis: usize,
        input: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
    },

    #[error("Spatial axis {axis} overflows the addressable size.")]
    ExtentOverflow { axis: usize },

    #[error("Window {kernel} does not fit spatial axis {axis} of extent {input} with pad {pad}.")]
    WindowLargerThanInput {
        axis: usize,
        input: usize,
        kernel: usize,
        pad: usize,
    },

    #[error("Spatial axis {axis}: unpooled extent {unpooled} cannot hold input extent {input}.")]
    UnpooledExtentTooSmall {
        axis: usize,
        input: usize,
        unpooled: usize,
    },

    #[error("Mask shape {mask:?} must equal the input shape {input:?}.")]
    MaskShapeMismatch { input: Shape, mask: Shape },
}

type Result<T> = std::result::Result<T, ShapeError>;

/// Unpooled extent of one spatial axis: `(input - 1) * stride + kernel - 2 * pad`.
pub fn unpooled_extent(
    axis: usize,
    input: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
) -> Result<usize> {
    let overflow = ShapeError::ExtentOverflow { axis };
    let degenerate = ShapeError::DegenerateExtent {
        axis,
        input,
        kernel,
        stride,
        pad,
    };
    if input == 0 {
        return Err(degenerate);
    }
    let grown = (input - 1)
        .checked_mul(stride)
        .and_then(|v| v.checked_add(kernel))
        .ok_or(overflow.clone())?;
    let margin = pad.checked_mul(2).ok_or(overflow)?;
    if grown <= margin {
        return Err(degenerate);
    }
    Ok(grown - margin)
}

/// Pooled extent of one spatial axis, rounding partial windows up.
///
/// The last window is dropped when it would start inside the trailing pad.
pub fn pooled_extent(
    axis: usize,
    input: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
) -> Result<usize> {
    let padded = input + 2 * pad;
    if input == 0 || padded < kernel {
        return Err(ShapeError::WindowLargerThanInput {
            axis,
            input,
            kernel,
            pad,
        });
    }
    let mut pooled = (padded - kernel).div_ceil(stride) + 1;
    if pad > 0 && (pooled - 1) * stride >= input + pad {
        pooled -= 1;
    }
    Ok(pooled)
}

fn check_rank(input_shape: &[usize], num_spatial_axes: usize) -> Result<()> {
    let expected = num_spatial_axes + 2;
    if input_shape.len() != expected {
        return Err(ShapeError::InvalidRank {
            expected,
            actual: input_shape.len(),
        });
    }
    Ok(())
}

/// Output shape `[num, channels, unpooled...]` of an unpooling layer.
pub fn infer_unpooled_shape(
    input_shape: &[usize],
    kernel: &[usize],
    stride: &[usize],
    pad: &[usize],
) -> Result<Shape> {
    check_rank(input_shape, kernel.len())?;
    let mut output = input_shape[..2].to_vec();
    for (axis, &input) in input_shape[2..].iter().enumerate() {
        output.push(unpooled_extent(axis, input, kernel[axis], stride[axis], pad[axis])?);
    }
    Ok(output)
}

/// Output shape `[num, channels, pooled...]` of a pooling layer.
pub fn infer_pooled_shape(
    input_shape: &[usize],
    kernel: &[usize],
    stride: &[usize],
    pad: &[usize],
) -> Result<Shape> {
    check_rank(input_shape, kernel.len())?;
    let mut output = input_shape[..2].to_vec();
    for (axis, &input) in input_shape[2..].iter().enumerate() {
        output.push(pooled_extent(axis, input, kernel[axis], stride[axis], pad[axis])?);
    }
    Ok(output)
}

/// Shape of the grid a pooling mask indexes: the pooled shape grown back by
/// unpooling. It must cover every input position on each spatial axis.
pub fn infer_mask_grid(
    input_shape: &[usize],
    pooled_shape: &[usize],
    kernel: &[usize],
    stride: &[usize],
    pad: &[usize],
) -> Result<Shape> {
    check_rank(input_shape, kernel.len())?;
    let grid = infer_unpooled_shape(pooled_shape, kernel, stride, pad)?;
    for (axis, (&input, &unpooled)) in input_shape[2..].iter().zip(&grid[2..]).enumerate() {
        if unpooled < input {
            return Err(ShapeError::UnpooledExtentTooSmall {
                axis,
                input,
                unpooled,
            });
        }
    }
    Ok(grid)
}

/// The mask carries one index per input element, so shapes must match exactly.
pub fn check_mask_shape(input_shape: &[usize], mask_shape: &[usize]) -> Result<()> {
    if input_shape != mask_shape {
        return Err(ShapeError::MaskShapeMismatch {
            input: input_shape.to_vec(),
            mask: mask_shape.to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpooled_extent_matrix() {
        // (input, kernel, stride, pad)
        let cases = [
            (2, 2, 2, 0),
            (3, 3, 2, 1),
            (5, 3, 1, 0),
            (1, 4, 3, 1),
            (7, 2, 3, 0),
            (4, 5, 2, 2),
            (10, 1, 1, 0),
        ];
        for (input, kernel, stride, pad) in cases {
            let expected = (input - 1) * stride + kernel - 2 * pad;
            assert_eq!(
                unpooled_extent(0, input, kernel, stride, pad).unwrap(),
                expected,
                "input={input} kernel={kernel} stride={stride} pad={pad}"
            );
        }
    }

    #[test]
    fn test_unpooled_extent_degenerate() {
        assert!(matches!(
            unpooled_extent(1, 0, 2, 2, 0),
            Err(ShapeError::DegenerateExtent { axis: 1, .. })
        ));
        assert!(matches!(
            unpooled_extent(0, 1, 3, 1, 2),
            Err(ShapeError::DegenerateExtent { .. })
        ));
        assert!(matches!(
            unpooled_extent(0, usize::MAX, 2, 2, 0),
            Err(ShapeError::ExtentOverflow { axis: 0 })
        ));
    }

    #[test]
    fn test_pooled_extent_inverts_unpooled() {
        for (unpooled, kernel, stride) in [(4, 2, 2), (6, 3, 3), (9, 3, 2), (5, 1, 1)] {
            let pooled = pooled_extent(0, unpooled, kernel, stride, 0).unwrap();
            let restored = unpooled_extent(0, pooled, kernel, stride, 0).unwrap();
            assert_eq!(restored, unpooled);
        }
    }

    #[test]
    fn test_pooled_extent_rounds_up_and_clips() {
        assert_eq!(pooled_extent(0, 5, 2, 2, 0).unwrap(), 3);
        // ceil((4 + 2 - 3) / 2) + 1 = 3; the third window starts at 4, before input + pad = 5.
        assert_eq!(pooled_extent(0, 4, 3, 2, 1).unwrap(), 3);
        // ceil((3 + 2 - 2) / 2) + 1 = 3; third window starts at 4 >= 3 + 1, dropped.
        assert_eq!(pooled_extent(0, 3, 2, 2, 1).unwrap(), 2);
        assert!(pooled_extent(0, 1, 3, 1, 0).is_err());
    }

    #[test]
    fn test_infer_unpooled_shape() {
        let shape = infer_unpooled_shape(&[2, 3, 2, 5], &[2, 3], &[2, 1], &[0, 1]).unwrap();
        assert_eq!(shape, vec![2, 3, 4, 5]);

        let volumetric = infer_unpooled_shape(&[1, 1, 2, 2, 2], &[2; 3], &[2; 3], &[0; 3]).unwrap();
        assert_eq!(volumetric, vec![1, 1, 4, 4, 4]);

        assert_eq!(
            infer_unpooled_shape(&[2, 3, 4], &[2, 2], &[2, 2], &[0, 0]),
            Err(ShapeError::InvalidRank {
                expected: 4,
                actual: 3,
            })
        );
    }

    #[test]
    fn test_mask_grid_of_odd_and_padded_inputs() {
        let kernel = [2, 2];
        // 5 -> 3 -> 6: the grid is wider than the input.
        let pooled = infer_pooled_shape(&[1, 1, 5, 5], &kernel, &[2, 2], &[0, 0]).unwrap();
        let grid = infer_mask_grid(&[1, 1, 5, 5], &pooled, &kernel, &[2, 2], &[0, 0]).unwrap();
        assert_eq!(grid, vec![1, 1, 6, 6]);

        // 4 -> 3 -> 4 with pad 1.
        let pooled = infer_pooled_shape(&[1, 1, 4, 4], &kernel, &[2, 2], &[1, 1]).unwrap();
        let grid = infer_mask_grid(&[1, 1, 4, 4], &pooled, &kernel, &[2, 2], &[1, 1]).unwrap();
        assert_eq!(grid, vec![1, 1, 4, 4]);

        // 5 -> 3 -> 4 with pad 1 loses the last input row and column.
        let pooled = infer_pooled_shape(&[1, 1, 5, 5], &kernel, &[2, 2], &[1, 1]).unwrap();
        assert_eq!(
            infer_mask_grid(&[1, 1, 5, 5], &pooled, &kernel, &[2, 2], &[1, 1]),
            Err(ShapeError::UnpooledExtentTooSmall {
                axis: 0,
                input: 5,
                unpooled: 4,
            })
        );
    }

    #[test]
    fn test_mask_shape_check() {
        assert!(check_mask_shape(&[1, 2, 3, 3], &[1, 2, 3, 3]).is_ok());
        assert!(matches!(
            check_mask_shape(&[1, 2, 3, 3], &[1, 1, 3, 3]),
            Err(ShapeError::MaskShapeMismatch { .. })
        ));
    }
}
