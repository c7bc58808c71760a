//! Parameter records for the unpooling layers and their resolution into
//! concrete kernel/pad/stride geometry.
//!
//! The records mirror the model-description format: every field is optional
//! and the scalar and per-axis spellings are mutually exclusive. Resolution
//! fails fast with a [`ConfigError`]; nothing is silently defaulted except the
//! documented pad (0) and stride (1).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors detected while resolving a parameter record.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Filter size is kernel_size OR kernel_h and kernel_w; not both.")]
    KernelSizeConflict,

    #[error("For non-square filters both kernel_h and kernel_w are required.")]
    KernelSizeMissing,

    #[error("pad is pad OR pad_h and pad_w are required.")]
    PadConflict,

    #[error("Stride is stride OR stride_h and stride_w are required.")]
    StrideConflict,

    #[error("Filter dimensions cannot be zero (spatial axis {axis}).")]
    ZeroKernel { axis: usize },

    #[error("Stride cannot be zero (spatial axis {axis}).")]
    ZeroStride { axis: usize },

    #[error("Pad {pad} must be smaller than kernel {kernel} on spatial axis {axis}.")]
    PadNotLessThanKernel {
        axis: usize,
        pad: usize,
        kernel: usize,
    },

    #[error("'{field}' has {actual} values; expected 1 or {expected} (one per spatial axis).")]
    AxisCountMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Input needs a spatial axis after (num, channels); got {num_axes} axes.")]
    NoSpatialAxes { num_axes: usize },

    #[error("With global_pooling the filter size cannot be specified.")]
    GlobalWithKernel,

    #[error("With global_pooling only pad = 0 and stride = 1 are allowed.")]
    GlobalRequiresUnitStride,

    #[error("Failed to parse parameter record: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Execution engine requested for a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Accelerated when an adapter is present, reference otherwise.
    #[default]
    Default,
    /// Always the CPU reference kernels.
    Reference,
    /// The wgpu path; setup fails when no adapter is available.
    Accelerated,
}

/// Kernel/pad/stride record of the 2-D unpooling layer.
///
/// The same record configures the paired max pooling layer, so a mask
/// produced with one record is consumed with the same record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnpoolingParameter {
    pub kernel_size: Option<u32>,
    pub kernel_h: Option<u32>,
    pub kernel_w: Option<u32>,
    pub pad: Option<u32>,
    pub pad_h: Option<u32>,
    pub pad_w: Option<u32>,
    pub stride: Option<u32>,
    pub stride_h: Option<u32>,
    pub stride_w: Option<u32>,
    pub engine: Engine,
}

impl UnpoolingParameter {
    /// Square kernel with stride equal to the kernel, the usual 2x2/2 setup.
    pub fn square(size: u32) -> Self {
        Self {
            kernel_size: Some(size),
            stride: Some(size),
            ..Default::default()
        }
    }

    /// Parses a record from its JSON form.
    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn with_kernel_size(mut self, size: u32) -> Self {
        self.kernel_size = Some(size);
        self
    }

    pub fn with_kernel(mut self, kernel_h: u32, kernel_w: u32) -> Self {
        self.kernel_h = Some(kernel_h);
        self.kernel_w = Some(kernel_w);
        self
    }

    pub fn with_pad(mut self, pad: u32) -> Self {
        self.pad = Some(pad);
        self
    }

    pub fn with_pad_hw(mut self, pad_h: u32, pad_w: u32) -> Self {
        self.pad_h = Some(pad_h);
        self.pad_w = Some(pad_w);
        self
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = Some(stride);
        self
    }

    pub fn with_stride_hw(mut self, stride_h: u32, stride_w: u32) -> Self {
        self.stride_h = Some(stride_h);
        self.stride_w = Some(stride_w);
        self
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    /// Validates the record and produces concrete geometry.
    ///
    /// `kernel_size` excludes both `kernel_h` and `kernel_w`, so a scalar kernel
    /// next to a single half of the pair is a conflict rather than ignored.
    pub fn resolve(&self) -> Result<PoolGeometry2d> {
        let (kernel_h, kernel_w) = match (self.kernel_size, self.kernel_h, self.kernel_w) {
            (Some(size), None, None) => (size, size),
            (None, Some(h), Some(w)) => (h, w),
            (Some(_), _, _) => return Err(ConfigError::KernelSizeConflict),
            (None, _, _) => return Err(ConfigError::KernelSizeMissing),
        };
        let (pad_h, pad_w) =
            scalar_or_pair(self.pad, self.pad_h, self.pad_w, 0).ok_or(ConfigError::PadConflict)?;
        let (stride_h, stride_w) = scalar_or_pair(self.stride, self.stride_h, self.stride_w, 1)
            .ok_or(ConfigError::StrideConflict)?;

        let geometry = PoolGeometry2d {
            kernel_h: kernel_h as usize,
            kernel_w: kernel_w as usize,
            pad_h: pad_h as usize,
            pad_w: pad_w as usize,
            stride_h: stride_h as usize,
            stride_w: stride_w as usize,
        };
        validate_axes(&geometry.kernel(), &geometry.pad(), &geometry.stride())?;
        Ok(geometry)
    }
}

/// `Some((h, w))` when the field is given as a scalar, as a complete pair, or
/// not at all; `None` for any mix.
fn scalar_or_pair(
    scalar: Option<u32>,
    h: Option<u32>,
    w: Option<u32>,
    default: u32,
) -> Option<(u32, u32)> {
    match (scalar, h, w) {
        (None, Some(h), Some(w)) => Some((h, w)),
        (scalar, None, None) => {
            let value = scalar.unwrap_or(default);
            Some((value, value))
        }
        _ => None,
    }
}

/// Resolved 2-D geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry2d {
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
}

impl PoolGeometry2d {
    pub fn kernel(&self) -> [usize; 2] {
        [self.kernel_h, self.kernel_w]
    }

    pub fn pad(&self) -> [usize; 2] {
        [self.pad_h, self.pad_w]
    }

    pub fn stride(&self) -> [usize; 2] {
        [self.stride_h, self.stride_w]
    }
}

/// Kernel/pad/stride record of the N-dimensional unpooling layer.
///
/// Each list holds either a single value, applied to every spatial axis, or
/// one value per spatial axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NdUnpoolingParameter {
    pub kernel_shape: Vec<u32>,
    pub pad_shape: Vec<u32>,
    pub stride_shape: Vec<u32>,
    pub global_pooling: bool,
    pub engine: Engine,
}

impl NdUnpoolingParameter {
    pub fn new(kernel_shape: Vec<u32>) -> Self {
        Self {
            kernel_shape,
            ..Default::default()
        }
    }

    /// Global mode: the kernel spans the whole input extent on every axis.
    pub fn global() -> Self {
        Self {
            global_pooling: true,
            ..Default::default()
        }
    }

    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn with_pad(mut self, pad_shape: Vec<u32>) -> Self {
        self.pad_shape = pad_shape;
        self
    }

    pub fn with_stride(mut self, stride_shape: Vec<u32>) -> Self {
        self.stride_shape = stride_shape;
        self
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    /// Validates the record for an input with `num_spatial_axes` spatial axes.
    pub fn resolve(&self, num_spatial_axes: usize) -> Result<PoolGeometryNd> {
        if num_spatial_axes == 0 {
            return Err(ConfigError::NoSpatialAxes {
                num_axes: num_spatial_axes + 2,
            });
        }
        let pad = expand_axis_list("pad_shape", &self.pad_shape, num_spatial_axes, 0)?;
        let stride = expand_axis_list("stride_shape", &self.stride_shape, num_spatial_axes, 1)?;

        if self.global_pooling {
            if !self.kernel_shape.is_empty() {
                return Err(ConfigError::GlobalWithKernel);
            }
            if pad.iter().any(|&p| p != 0) || stride.iter().any(|&s| s != 1) {
                return Err(ConfigError::GlobalRequiresUnitStride);
            }
            return Ok(PoolGeometryNd {
                kernel: Vec::new(),
                pad,
                stride,
                global: true,
            });
        }

        if self.kernel_shape.is_empty() {
            return Err(ConfigError::KernelSizeMissing);
        }
        let kernel = expand_axis_list("kernel_shape", &self.kernel_shape, num_spatial_axes, 0)?;
        validate_axes(&kernel, &pad, &stride)?;
        Ok(PoolGeometryNd {
            kernel,
            pad,
            stride,
            global: false,
        })
    }
}

fn expand_axis_list(
    field: &'static str,
    values: &[u32],
    num_axes: usize,
    default: u32,
) -> Result<Vec<usize>> {
    match values.len() {
        0 => Ok(vec![default as usize; num_axes]),
        1 => Ok(vec![values[0] as usize; num_axes]),
        n if n == num_axes => Ok(values.iter().map(|&v| v as usize).collect()),
        n => Err(ConfigError::AxisCountMismatch {
            field,
            expected: num_axes,
            actual: n,
        }),
    }
}

/// Resolved N-dimensional geometry. In global mode `kernel` is empty and the
/// effective kernel is the input's spatial extent, see [`PoolGeometryNd::kernel_for`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolGeometryNd {
    pub kernel: Vec<usize>,
    pub pad: Vec<usize>,
    pub stride: Vec<usize>,
    pub global: bool,
}

impl PoolGeometryNd {
    pub fn num_spatial_axes(&self) -> usize {
        self.pad.len()
    }

    /// Effective kernel for an input with the given spatial extent.
    pub fn kernel_for<'a>(&'a self, input_spatial: &'a [usize]) -> &'a [usize] {
        if self.global {
            input_spatial
        } else {
            &self.kernel
        }
    }
}

impl From<PoolGeometry2d> for PoolGeometryNd {
    fn from(geometry: PoolGeometry2d) -> Self {
        Self {
            kernel: geometry.kernel().to_vec(),
            pad: geometry.pad().to_vec(),
            stride: geometry.stride().to_vec(),
            global: false,
        }
    }
}

fn validate_axes(kernel: &[usize], pad: &[usize], stride: &[usize]) -> Result<()> {
    for (axis, (&k, &s)) in kernel.iter().zip(stride).enumerate() {
        if k == 0 {
            return Err(ConfigError::ZeroKernel { axis });
        }
        if s == 0 {
            return Err(ConfigError::ZeroStride { axis });
        }
    }
    if pad.iter().any(|&p| p != 0) {
        for (axis, (&p, &k)) in pad.iter().zip(kernel).enumerate() {
            if p >= k {
                return Err(ConfigError::PadNotLessThanKernel {
                    axis,
                    pad: p,
                    kernel: k,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_kernel_defaults() {
        let geometry = UnpoolingParameter::default()
            .with_kernel_size(3)
            .resolve()
            .unwrap();
        assert_eq!(geometry.kernel(), [3, 3]);
        assert_eq!(geometry.pad(), [0, 0]);
        assert_eq!(geometry.stride(), [1, 1]);
    }

    #[test]
    fn test_per_axis_fields() {
        let geometry = UnpoolingParameter::default()
            .with_kernel(3, 2)
            .with_pad_hw(1, 0)
            .with_stride_hw(2, 1)
            .resolve()
            .unwrap();
        assert_eq!(
            geometry,
            PoolGeometry2d {
                kernel_h: 3,
                kernel_w: 2,
                pad_h: 1,
                pad_w: 0,
                stride_h: 2,
                stride_w: 1,
            }
        );
    }

    #[test]
    fn test_kernel_both_forms_rejected() {
        let param = UnpoolingParameter::default()
            .with_kernel_size(2)
            .with_kernel(2, 2);
        assert!(matches!(param.resolve(), Err(ConfigError::KernelSizeConflict)));

        // A scalar plus either half of the pair is a conflict too.
        let mut half_w = UnpoolingParameter::default().with_kernel_size(2);
        half_w.kernel_w = Some(3);
        assert!(matches!(half_w.resolve(), Err(ConfigError::KernelSizeConflict)));

        let mut half_h = UnpoolingParameter::default().with_kernel_size(2);
        half_h.kernel_h = Some(3);
        assert!(matches!(half_h.resolve(), Err(ConfigError::KernelSizeConflict)));
    }

    #[test]
    fn test_kernel_missing_rejected() {
        assert!(matches!(
            UnpoolingParameter::default().resolve(),
            Err(ConfigError::KernelSizeMissing)
        ));

        let mut only_h = UnpoolingParameter::default();
        only_h.kernel_h = Some(2);
        assert!(matches!(only_h.resolve(), Err(ConfigError::KernelSizeMissing)));
    }

    #[test]
    fn test_pad_and_stride_mixes_rejected() {
        let mut pad_mix = UnpoolingParameter::square(3).with_pad(1);
        pad_mix.pad_h = Some(1);
        assert!(matches!(pad_mix.resolve(), Err(ConfigError::PadConflict)));

        let mut pad_half = UnpoolingParameter::square(3);
        pad_half.pad_w = Some(1);
        assert!(matches!(pad_half.resolve(), Err(ConfigError::PadConflict)));

        let stride_mix = UnpoolingParameter::default()
            .with_kernel_size(2)
            .with_stride(2)
            .with_stride_hw(2, 2);
        assert!(matches!(stride_mix.resolve(), Err(ConfigError::StrideConflict)));
    }

    #[test]
    fn test_zero_kernel_and_stride_rejected() {
        assert!(matches!(
            UnpoolingParameter::default().with_kernel(2, 0).resolve(),
            Err(ConfigError::ZeroKernel { axis: 1 })
        ));
        assert!(matches!(
            UnpoolingParameter::square(2).with_stride(0).resolve(),
            Err(ConfigError::ZeroStride { axis: 0 })
        ));
    }

    #[test]
    fn test_pad_must_be_less_than_kernel() {
        let param = UnpoolingParameter::square(2).with_pad(2);
        assert!(matches!(
            param.resolve(),
            Err(ConfigError::PadNotLessThanKernel {
                axis: 0,
                pad: 2,
                kernel: 2,
            })
        ));

        // Each axis is checked against its own kernel extent.
        let param = UnpoolingParameter::default()
            .with_kernel(3, 1)
            .with_pad_hw(1, 1);
        assert!(matches!(
            param.resolve(),
            Err(ConfigError::PadNotLessThanKernel { axis: 1, .. })
        ));

        assert!(UnpoolingParameter::square(3).with_pad(1).resolve().is_ok());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{ "kernel_h": 3, "kernel_w": 2, "stride": 2, "engine": "reference" }"#;
        let param = UnpoolingParameter::from_json(json).unwrap();
        assert_eq!(param.engine, Engine::Reference);
        let geometry = param.resolve().unwrap();
        assert_eq!(geometry.kernel(), [3, 2]);
        assert_eq!(geometry.stride(), [2, 2]);

        assert!(matches!(
            UnpoolingParameter::from_json(r#"{ "kernel": 2 }"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_nd_broadcast_and_per_axis() {
        let geometry = NdUnpoolingParameter::new(vec![2])
            .with_stride(vec![2, 1, 2])
            .resolve(3)
            .unwrap();
        assert_eq!(geometry.kernel, vec![2, 2, 2]);
        assert_eq!(geometry.stride, vec![2, 1, 2]);
        assert_eq!(geometry.pad, vec![0, 0, 0]);
        assert_eq!(geometry.kernel_for(&[9, 9, 9]), &[2, 2, 2]);
    }

    #[test]
    fn test_nd_axis_count_mismatch() {
        let param = NdUnpoolingParameter::new(vec![2, 2]);
        assert!(matches!(
            param.resolve(3),
            Err(ConfigError::AxisCountMismatch {
                field: "kernel_shape",
                expected: 3,
                actual: 2,
            })
        ));
    }

    #[test]
    fn test_nd_global_rules() {
        let geometry = NdUnpoolingParameter::global().resolve(2).unwrap();
        assert!(geometry.global);
        assert_eq!(geometry.kernel_for(&[5, 7]), &[5, 7]);

        let mut with_kernel = NdUnpoolingParameter::global();
        with_kernel.kernel_shape = vec![2];
        assert!(matches!(with_kernel.resolve(2), Err(ConfigError::GlobalWithKernel)));

        let strided = NdUnpoolingParameter::global().with_stride(vec![2]);
        assert!(matches!(
            strided.resolve(2),
            Err(ConfigError::GlobalRequiresUnitStride)
        ));
    }

    #[test]
    fn test_nd_missing_kernel_and_zero_axes() {
        assert!(matches!(
            NdUnpoolingParameter::default().resolve(2),
            Err(ConfigError::KernelSizeMissing)
        ));
        assert!(matches!(
            NdUnpoolingParameter::new(vec![2]).resolve(0),
            Err(ConfigError::NoSpatialAxes { .. })
        ));
    }

    #[test]
    fn test_geometry_2d_into_nd() {
        let geometry: PoolGeometryNd = UnpoolingParameter::square(2).resolve().unwrap().into();
        assert_eq!(geometry.kernel, vec![2, 2]);
        assert_eq!(geometry.stride, vec![2, 2]);
        assert!(!geometry.global);
    }
}
