//! # RustyUnpool: Max-Unpooling Layers in Rust
//!
//! **RustyUnpool** implements the max-unpooling layer of encoder/decoder
//! segmentation networks. A max pooling layer records where each maximum came
//! from; unpooling scatters pooled values back to those positions and gathers
//! gradients the same way.
//!
//! Two execution paths share one contract: a CPU reference operator and a
//! wgpu compute operator, picked per layer from the configured engine and the
//! adapters present on the machine.
//!
//! ## Usage Example
//!
//! ```no_run
//! use rustyunpool::nn::{Layer, MaxPoolingLayer, UnpoolingLayer};
//! use rustyunpool::params::UnpoolingParameter;
//! use rustyunpool::tensor::Blob;
//!
//! # fn main() -> Result<(), rustyunpool::nn::LayerError> {
//! let param = UnpoolingParameter::square(2);
//! let mut pool = MaxPoolingLayer::new(param.clone());
//! let mut unpool = UnpoolingLayer::new(param);
//!
//! let input = vec![Blob::new(&[1, 3, 8, 8])];
//! let mut pooled = vec![Blob::new(&[1]), Blob::new(&[1])];
//! pool.setup(&input, &mut pooled)?;
//! pool.forward(&input, &mut pooled)?;
//!
//! // `pooled` is [values, mask]: exactly the unpooling bottoms.
//! let mut restored = vec![Blob::new(&[1])];
//! unpool.setup(&pooled, &mut restored)?;
//! unpool.forward(&pooled, &mut restored)?;
//! assert_eq!(restored[0].shape(), &[1, 3, 8, 8]);
//! # Ok(())
//! # }
//! ```

// Declare public modules that constitute the core library API.
pub mod analysis;
pub mod nn;
pub mod params;
pub mod runtime;
pub mod tensor;
