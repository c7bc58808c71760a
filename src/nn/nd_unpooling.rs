//! Module implementing the N-dimensional max-unpooling layer.
//!
//! Spatial axes are every axis after the channel axis, so the same layer
//! handles 1-D sequences, 2-D images and 3-D volumes. Kernel, pad and stride
//! come as per-axis lists; global mode spans the whole input extent.

use crate::analysis::{check_mask_shape, infer_unpooled_shape, Shape, ShapeError};
use crate::nn::module::{Layer, LayerError, Result};
use crate::nn::unpooling::{gather_blobs, scatter_blobs};
use crate::params::{ConfigError, NdUnpoolingParameter, PoolGeometryNd};
use crate::runtime::{detect_capability, instantiate, UnpoolingOperator};
use crate::tensor::Blob;

#[derive(Debug)]
pub struct NdUnpoolingLayer {
    param: NdUnpoolingParameter,
    geometry: Option<PoolGeometryNd>,
    input_shape: Shape,
    output_shape: Shape,
    operator: Option<Box<dyn UnpoolingOperator>>,
}

impl NdUnpoolingLayer {
    pub fn new(param: NdUnpoolingParameter) -> Self {
        Self {
            param,
            geometry: None,
            input_shape: Shape::new(),
            output_shape: Shape::new(),
            operator: None,
        }
    }

    pub fn param(&self) -> &NdUnpoolingParameter {
        &self.param
    }

    pub fn geometry(&self) -> Option<&PoolGeometryNd> {
        self.geometry.as_ref()
    }

    /// Effective kernel for the last reshaped input. Equals the input's
    /// spatial extent in global mode.
    pub fn kernel(&self) -> Option<&[usize]> {
        let geometry = self.geometry.as_ref()?;
        let spatial = self.input_shape.get(2..)?;
        Some(geometry.kernel_for(spatial))
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    pub fn operator_name(&self) -> Option<&'static str> {
        self.operator.as_ref().map(|op| op.name())
    }

    fn operator(&self) -> Result<&dyn UnpoolingOperator> {
        self.operator
            .as_deref()
            .ok_or(LayerError::NotSetUp(self.layer_type()))
    }
}

impl Layer for NdUnpoolingLayer {
    fn layer_type(&self) -> &'static str {
        "NdUnpooling"
    }

    fn exact_num_bottom_blobs(&self) -> usize {
        2
    }

    fn exact_num_top_blobs(&self) -> usize {
        1
    }

    fn layer_setup(&mut self, bottom: &[Blob], _top: &mut [Blob]) -> Result<()> {
        let num_axes = bottom.first().map_or(0, Blob::num_axes);
        if num_axes < 3 {
            return Err(ConfigError::NoSpatialAxes { num_axes }.into());
        }
        let geometry = self.param.resolve(num_axes - 2)?;
        if self.operator.is_none() {
            let capability = detect_capability(self.param.engine)?;
            self.operator = Some(instantiate(self.param.engine, capability)?);
        }
        log::debug!(
            "{} layer: {} spatial axes, global {}, operator '{}'",
            self.layer_type(),
            geometry.num_spatial_axes(),
            geometry.global,
            self.operator_name().unwrap_or("none"),
        );
        self.geometry = Some(geometry);
        Ok(())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        self.check_blob_counts(bottom.len(), top.len())?;
        let geometry = self
            .geometry
            .as_ref()
            .ok_or(LayerError::NotSetUp(self.layer_type()))?;
        let input_shape = bottom[0].shape();
        check_mask_shape(input_shape, bottom[1].shape())?;
        let expected_rank = geometry.num_spatial_axes() + 2;
        if input_shape.len() != expected_rank {
            return Err(ShapeError::InvalidRank {
                expected: expected_rank,
                actual: input_shape.len(),
            }
            .into());
        }

        let spatial = &input_shape[2..];
        let output_shape = infer_unpooled_shape(
            input_shape,
            geometry.kernel_for(spatial),
            &geometry.stride,
            &geometry.pad,
        )?;
        top[0].reshape(&output_shape);
        self.input_shape = input_shape.to_vec();
        self.output_shape = output_shape;
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
