//! # Layers Module
//!
//! Layers read `bottom` blobs and write `top` blobs through the [`Layer`]
//! contract: `setup` once, `reshape` when input shapes change, then
//! `forward`/`backward`.
//!
//! ## Available Layers
//!
//! - [`UnpoolingLayer`]: 2-D max-unpooling driven by a pooling mask
//! - [`NdUnpoolingLayer`]: N-dimensional max-unpooling with global mode
//! - [`MaxPoolingLayer`]: 2-D max pooling that records the mask
//!
//! ## Example
//!
//! ```ignore
//! use rustyunpool::nn::{Layer, MaxPoolingLayer, UnpoolingLayer};
//! use rustyunpool::params::UnpoolingParameter;
//!
//! let param = UnpoolingParameter::square(2);
//! let mut pool = MaxPoolingLayer::new(param.clone());
//! let mut unpool = UnpoolingLayer::new(param);
//!
//! pool.setup(&input, &mut pooled)?;
//! pool.forward(&input, &mut pooled)?;
//! unpool.setup(&pooled, &mut restored)?;
//! unpool.forward(&pooled, &mut restored)?;
//! ```

pub mod module;
pub mod nd_unpooling;
pub mod pooling;
pub mod unpooling;

pub use module::{Layer, LayerError};
pub use nd_unpooling::NdUnpoolingLayer;
pub use pooling::MaxPoolingLayer;
pub use unpooling::UnpoolingLayer;
