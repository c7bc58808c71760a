//! Module implementing max pooling with an index mask, the producer side of
//! unpooling.

use crate::analysis::{infer_mask_grid, infer_pooled_shape};
use crate::nn::module::{check_count, Layer, LayerError, Result};
use crate::params::{PoolGeometry2d, UnpoolingParameter};
use crate::runtime::cpu_backend::{max_pool2d_backward, max_pool2d_forward, PoolPlane};
use crate::tensor::Blob;

/// Max Pooling 2D layer with mask output.
///
/// Applies max pooling to an input of shape [N, C, H, W]. `top[0]` holds the
/// pooled values, `top[1]` the flat index of each maximum in the grid an
/// unpooling layer with the same parameters produces from `top[0]`.
///
/// # Example
///
/// ```rust,ignore
/// let param = UnpoolingParameter::square(2);
/// let mut pool = MaxPoolingLayer::new(param.clone());
/// let mut unpool = UnpoolingLayer::new(param);
/// pool.setup(&[input], &mut pooled)?; // pooled = [values, mask]
/// ```
#[derive(Debug)]
pub struct MaxPoolingLayer {
    param: UnpoolingParameter,
    geometry: Option<PoolGeometry2d>,
    plane: Option<PoolPlane>,
}

impl MaxPoolingLayer {
    /// Takes the same record as the unpooling layer so both agree on geometry.
    pub fn new(param: UnpoolingParameter) -> Self {
        Self {
            param,
            geometry: None,
            plane: None,
        }
    }

    pub fn geometry(&self) -> Option<&PoolGeometry2d> {
        self.geometry.as_ref()
    }

    /// Input, pooled and mask grid extents computed by the last reshape.
    pub fn plane(&self) -> Option<&PoolPlane> {
        self.plane.as_ref()
    }

    fn ready(&self) -> Result<(PoolGeometry2d, PoolPlane)> {
        match (self.geometry, self.plane) {
            (Some(geometry), Some(plane)) => Ok((geometry, plane)),
            _ => Err(LayerError::NotSetUp(self.layer_type())),
        }
    }
}

impl Layer for MaxPoolingLayer {
    fn layer_type(&self) -> &'static str {
        "MaxPooling"
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        1
    }

    fn exact_num_top_blobs(&self) -> usize {
        2
    }

    fn layer_setup(&mut self, _bottom: &[Blob], _top: &mut [Blob]) -> Result<()> {
        let geometry = self.param.resolve()?;
        log::debug!(
            "{} layer: kernel {:?}, stride {:?}, pad {:?}",
            self.layer_type(),
            geometry.kernel(),
            geometry.stride(),
            geometry.pad(),
        );
        self.geometry = Some(geometry);
        Ok(())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        self.check_blob_counts(bottom.len(), top.len())?;
        let Some(geometry) = self.geometry else {
            return Err(LayerError::NotSetUp(self.layer_type()));
        };
        let (kernel, stride, pad) = (geometry.kernel(), geometry.stride(), geometry.pad());
        let input_shape = bottom[0].shape();
        let pooled_shape = infer_pooled_shape(input_shape, &kernel, &stride, &pad)?;
        let grid = infer_mask_grid(input_shape, &pooled_shape, &kernel, &stride, &pad)?;

        let plane = PoolPlane::new(
            input_shape[2],
            input_shape[3],
            pooled_shape[2],
            pooled_shape[3],
        );
        self.plane = Some(plane.with_mask_grid(grid[2], grid[3]));
        for blob in top.iter_mut() {
            blob.reshape(&pooled_shape);
        }
        Ok(())
    }

    fn forward(&self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        let (geometry, plane) = self.ready()?;
        self.check_blob_counts(bottom.len(), top.len())?;
        let num_slices = bottom[0].shape_at(0)? * bottom[0].shape_at(1)?;

        let (values, mask) = top.split_at_mut(1);
        max_pool2d_forward(
            &geometry,
            &plane,
            num_slices,
            bottom[0].cpu_data()?,
            values[0].mutable_cpu_data()?,
            mask[0].mutable_cpu_data()?,
        )?;
        Ok(())
    }

    fn backward(&self, top: &[Blob], propagate_down: &[bool], bottom: &mut [Blob]) -> Result<()> {
        let (_, plane) = self.ready()?;
        self.check_blob_counts(bottom.len(), top.len())?;
        let flags = propagate_down.len();
        check_count(self.layer_type(), "propagate_down", 1, flags)?;
        if !propagate_down[0] {
            return Ok(());
        }
        let num_slices = bottom[0].shape_at(0)? * bottom[0].shape_at(1)?;
        max_pool2d_backward(
            &plane,
            num_slices,
            top[0].cpu_diff()?,
            top[1].cpu_data()?,
            bottom[0].mutable_cpu_diff()?,
        )?;
        Ok(())
    }
}
