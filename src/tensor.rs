//! Module defining `Blob`, the dense feature-map storage consumed by layers.
//!
//! A `Blob` owns two buffers of identical shape: the value buffer (`data`)
//! and the gradient buffer (`diff`). Both are kept in standard (row-major,
//! contiguous) layout so kernels can address them as flat slices with
//! explicit offsets.

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};
use thiserror::Error;

/// Errors raised by blob storage accessors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlobError {
    #[error("Blob storage for '{0}' is not contiguous in standard layout.")]
    NonContiguous(&'static str),

    #[error("Axis {axis} is out of range for a blob with {num_axes} axes.")]
    AxisOutOfRange { axis: usize, num_axes: usize },

    #[error("Gradient shape {actual:?} does not match value shape {expected:?}.")]
    DiffShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Dense N-axis tensor with a value buffer and a gradient buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    data: ArrayD<f32>,
    diff: ArrayD<f32>,
}

impl Blob {
    /// Creates a zero-filled blob of the given shape.
    pub fn new(shape: &[usize]) -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(shape)),
            diff: ArrayD::zeros(IxDyn(shape)),
        }
    }

    /// Wraps an existing array as the value buffer. The gradient starts at zero.
    pub fn from_array(data: ArrayD<f32>) -> Self {
        let data = standard(data);
        let diff = ArrayD::zeros(data.raw_dim());
        Self { data, diff }
    }

    /// (Re)allocates both buffers for a new shape.
    ///
    /// Storage is kept when the shape does not change, so repeated reshapes
    /// with identical dimensions preserve contents.
    pub fn reshape(&mut self, shape: &[usize]) {
        if self.data.shape() == shape {
            return;
        }
        self.data = ArrayD::zeros(IxDyn(shape));
        self.diff = ArrayD::zeros(IxDyn(shape));
    }

    /// Replaces the gradient buffer; its shape must match the value buffer.
    pub fn set_diff(&mut self, diff: ArrayD<f32>) -> Result<(), BlobError> {
        if diff.shape() != self.data.shape() {
            return Err(BlobError::DiffShapeMismatch {
                expected: self.data.shape().to_vec(),
                actual: diff.shape().to_vec(),
            });
        }
        self.diff = standard(diff);
        Ok(())
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn num_axes(&self) -> usize {
        self.data.ndim()
    }

    /// Total number of elements.
    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// Size of a single axis.
    pub fn shape_at(&self, axis: usize) -> Result<usize, BlobError> {
        self.shape()
            .get(axis)
            .copied()
            .ok_or(BlobError::AxisOutOfRange {
                axis,
                num_axes: self.num_axes(),
            })
    }

    // Legacy 4-D accessors: axes beyond the blob's rank report 1.

    pub fn num(&self) -> usize {
        self.legacy_axis(0)
    }

    pub fn channels(&self) -> usize {
        self.legacy_axis(1)
    }

    pub fn height(&self) -> usize {
        self.legacy_axis(2)
    }

    pub fn width(&self) -> usize {
        self.legacy_axis(3)
    }

    fn legacy_axis(&self, axis: usize) -> usize {
        self.shape().get(axis).copied().unwrap_or(1)
    }

    pub fn data(&self) -> ArrayViewD<'_, f32> {
        self.data.view()
    }

    pub fn data_mut(&mut self) -> ArrayViewMutD<'_, f32> {
        self.data.view_mut()
    }

    pub fn diff(&self) -> ArrayViewD<'_, f32> {
        self.diff.view()
    }

    pub fn diff_mut(&mut self) -> ArrayViewMutD<'_, f32> {
        self.diff.view_mut()
    }

    /// Flat read-only view of the value buffer.
    pub fn cpu_data(&self) -> Result<&[f32], BlobError> {
        self.data.as_slice().ok_or(BlobError::NonContiguous("data"))
    }

    /// Flat mutable view of the value buffer.
    pub fn mutable_cpu_data(&mut self) -> Result<&mut [f32], BlobError> {
        self.data
            .as_slice_mut()
            .ok_or(BlobError::NonContiguous("data"))
    }

    /// Flat read-only view of the gradient buffer.
    pub fn cpu_diff(&self) -> Result<&[f32], BlobError> {
        self.diff.as_slice().ok_or(BlobError::NonContiguous("diff"))
    }

    /// Flat mutable view of the gradient buffer.
    pub fn mutable_cpu_diff(&mut self) -> Result<&mut [f32], BlobError> {
        self.diff
            .as_slice_mut()
            .ok_or(BlobError::NonContiguous("diff"))
    }
}

fn standard(array: ArrayD<f32>) -> ArrayD<f32> {
    if array.is_standard_layout() {
        array
    } else {
        array.as_standard_layout().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Axis};

    #[test]
    fn test_new_blob_is_zeroed() {
        let blob = Blob::new(&[2, 3, 4, 5]);
        assert_eq!(blob.count(), 120);
        assert_eq!(blob.num_axes(), 4);
        assert!(blob.cpu_data().unwrap().iter().all(|&v| v == 0.0));
        assert!(blob.cpu_diff().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_legacy_accessors() {
        let blob = Blob::new(&[2, 3, 4, 5]);
        let dims = (blob.num(), blob.channels(), blob.height(), blob.width());
        assert_eq!(dims, (2, 3, 4, 5));

        let flat = Blob::new(&[7, 2]);
        assert_eq!(flat.height(), 1);
        assert_eq!(flat.width(), 1);
    }

    #[test]
    fn test_reshape_same_shape_keeps_contents() {
        let mut blob = Blob::from_array(array![[1.0, 2.0], [3.0, 4.0]].into_dyn());
        blob.reshape(&[2, 2]);
        assert_eq!(blob.cpu_data().unwrap(), &[1.0, 2.0, 3.0, 4.0]);

        blob.reshape(&[1, 4, 1]);
        assert_eq!(blob.shape(), &[1, 4, 1]);
        assert_eq!(blob.cpu_data().unwrap(), &[0.0; 4]);
        assert_eq!(blob.diff().shape(), &[1, 4, 1]);
    }

    #[test]
    fn test_from_array_normalizes_layout() {
        let transposed = array![[1.0, 2.0], [3.0, 4.0]].reversed_axes().into_dyn();
        assert!(!transposed.is_standard_layout());
        let blob = Blob::from_array(transposed);
        assert_eq!(blob.cpu_data().unwrap(), &[1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_shape_at() {
        let blob = Blob::new(&[2, 3, 4, 5]);
        assert_eq!(blob.shape_at(1).unwrap(), 3);
        assert_eq!(blob.shape_at(3).unwrap(), 5);
        assert_eq!(
            blob.shape_at(4),
            Err(BlobError::AxisOutOfRange {
                axis: 4,
                num_axes: 4,
            })
        );
    }

    #[test]
    fn test_set_diff_requires_matching_shape() {
        let mut blob = Blob::new(&[2, 2]);
        assert!(blob.set_diff(ArrayD::zeros(IxDyn(&[3]))).is_err());
        let diff = array![[1.0, 1.0], [2.0, 2.0]].into_dyn();
        blob.set_diff(diff).unwrap();
        let row_sums: Vec<f32> = blob.diff().sum_axis(Axis(1)).iter().copied().collect();
        assert_eq!(row_sums, vec![2.0, 4.0]);
    }
}
