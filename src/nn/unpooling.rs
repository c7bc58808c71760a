//! Module implementing the 2-D max-unpooling layer.
//!
//! Bottom blobs are the pooled features and the mask recorded by the matching
//! max pooling; the single top blob is the unpooled feature map.

use crate::analysis::{check_mask_shape, infer_unpooled_shape};
use crate::nn::module::{check_count, Layer, LayerError, Result};
use crate::params::{PoolGeometry2d, UnpoolingParameter};
use crate::runtime::{detect_capability, instantiate, SliceLayout, UnpoolingOperator};
use crate::tensor::Blob;

/// Max-unpooling over `[num, channels, height, width]` feature maps.
///
/// # Example
///
/// ```rust,ignore
/// let mut unpool = UnpoolingLayer::new(UnpoolingParameter::square(2));
/// unpool.setup(&bottom, &mut top)?; // [N, C, H, W] -> [N, C, 2H, 2W]
/// unpool.forward(&bottom, &mut top)?;
/// ```
#[derive(Debug)]
pub struct UnpoolingLayer {
    param: UnpoolingParameter,
    geometry: Option<PoolGeometry2d>,
    channels: usize,
    height: usize,
    width: usize,
    unpooled_height: usize,
    unpooled_width: usize,
    operator: Option<Box<dyn UnpoolingOperator>>,
}

impl UnpoolingLayer {
    pub fn new(param: UnpoolingParameter) -> Self {
        Self {
            param,
            geometry: None,
            channels: 0,
            height: 0,
            width: 0,
            unpooled_height: 0,
            unpooled_width: 0,
            operator: None,
        }
    }

    pub fn param(&self) -> &UnpoolingParameter {
        &self.param
    }

    /// Resolved geometry, available after setup.
    pub fn geometry(&self) -> Option<&PoolGeometry2d> {
        self.geometry.as_ref()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Input `(height, width)` seen by the last reshape.
    pub fn input_extent(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Output `(height, width)` computed by the last reshape.
    pub fn unpooled_extent(&self) -> (usize, usize) {
        (self.unpooled_height, self.unpooled_width)
    }

    /// Name of the selected operator (`"cpu"` or `"wgpu"`), once set up.
    pub fn operator_name(&self) -> Option<&'static str> {
        self.operator.as_ref().map(|op| op.name())
    }

    fn operator(&self) -> Result<&dyn UnpoolingOperator> {
        self.operator
            .as_deref()
            .ok_or(LayerError::NotSetUp(self.layer_type()))
    }
}

impl Layer for UnpoolingLayer {
    fn layer_type(&self) -> &'static str {
        "Unpooling"
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        2
    }

    fn exact_num_top_blobs(&self) -> usize {
        1
    }

    fn layer_setup(&mut self, _bottom: &[Blob], _top: &mut [Blob]) -> Result<()> {
        let geometry = self.param.resolve()?;
        if self.operator.is_none() {
            let capability = detect_capability(self.param.engine)?;
            self.operator = Some(instantiate(self.param.engine, capability)?);
        }
        log::debug!(
            "{} layer: kernel {:?}, stride {:?}, pad {:?}, operator '{}'",
            self.layer_type(),
            geometry.kernel(),
            geometry.stride(),
            geometry.pad(),
            self.operator_name().unwrap_or("none"),
        );
        self.geometry = Some(geometry);
        Ok(())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        self.check_blob_counts(bottom.len(), top.len())?;
        let Some(geometry) = self.geometry else {
            return Err(LayerError::NotSetUp(self.layer_type()));
        };
        let input_shape = bottom[0].shape();
        check_mask_shape(input_shape, bottom[1].shape())?;

        let output_shape = infer_unpooled_shape(
            input_shape,
            &geometry.kernel(),
            &geometry.stride(),
            &geometry.pad(),
        )?;
        self.channels = input_shape[1];
        self.height = input_shape[2];
        self.width = input_shape[3];
        self.unpooled_height = output_shape[2];
        self.unpooled_width = output_shape[3];
        top[0].reshape(&output_shape);
        Ok(())
    }

    fn forward(&self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        scatter_blobs(self.layer_type(), self.operator()?, bottom, top)
    }

    fn backward(&self, top: &[Blob], propagate_down: &[bool], bottom: &mut [Blob]) -> Result<()> {
        let layer = self.layer_type();
        gather_blobs(layer, self.operator()?, top, propagate_down, bottom)
    }
}

/// Forward pass shared by the unpooling layers: `top[0] = scatter(bottom[0], bottom[1])`.
pub(crate) fn scatter_blobs(
    layer: &'static str,
    operator: &dyn UnpoolingOperator,
    bottom: &[Blob],
    top: &mut [Blob],
) -> Result<()> {
    check_count(layer, "bottom", 2, bottom.len())?;
    check_count(layer, "top", 1, top.len())?;
    check_mask_shape(bottom[0].shape(), bottom[1].shape())?;

    let layout = SliceLayout::from_shapes(bottom[0].shape(), top[0].shape())?;
    operator.forward(
        &layout,
        bottom[0].cpu_data()?,
        bottom[1].cpu_data()?,
        top[0].mutable_cpu_data()?,
    )?;
    Ok(())
}

/// Backward pass shared by the unpooling layers. The mask never receives a gradient.
pub(crate) fn gather_blobs(
    layer: &'static str,
    operator: &dyn UnpoolingOperator,
    top: &[Blob],
    propagate_down: &[bool],
    bottom: &mut [Blob],
) -> Result<()> {
    check_count(layer, "bottom", 2, bottom.len())?;
    check_count(layer, "top", 1, top.len())?;
    check_count(layer, "propagate_down", 2, propagate_down.len())?;
    if !propagate_down[0] {
        return Ok(());
    }
    check_mask_shape(bottom[0].shape(), bottom[1].shape())?;

    let layout = SliceLayout::from_shapes(bottom[0].shape(), top[0].shape())?;
    let (features, mask) = bottom.split_at_mut(1);
    operator.backward(
        &layout,
        top[0].cpu_diff()?,
        mask[0].cpu_data()?,
        features[0].mutable_cpu_diff()?,
    )?;
    Ok(())
}
