//! Static analysis of layer geometry.
//!
//! Currently holds shape inference: the output shape of each layer is a pure
//! function of its input shape and resolved kernel/stride/pad.

pub mod shape_inference;

pub use shape_inference::{
    check_mask_shape, infer_mask_grid, infer_pooled_shape, infer_unpooled_shape, pooled_extent,
    unpooled_extent, Shape, ShapeError,
};
