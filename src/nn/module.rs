//! Module defining the core `Layer` trait for the unpooling and pooling layers.

use crate::analysis::ShapeError;
use crate::params::ConfigError;
use crate::runtime::RuntimeError;
use crate::tensor::{Blob, BlobError};
use thiserror::Error;

/// Errors raised by layers. Wraps the errors of every lower module.
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Blob error: {0}")]
    Blob(#[from] BlobError),

    #[error("{layer} layer takes exactly {expected} {kind} blob(s), got {actual}.")]
    BlobCount {
        layer: &'static str,
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{0} layer was used before setup.")]
    NotSetUp(&'static str),
}

pub type Result<T> = std::result::Result<T, LayerError>;

/// Common interface of layers that read `bottom` blobs and write `top` blobs.
///
/// The lifecycle is `setup` once, then `reshape` whenever bottom shapes change,
/// then any number of `forward`/`backward` calls.
pub trait Layer {
    /// Type name used in logs and errors.
    fn layer_type(&self) -> &'static str;

    fn exact_num_bottom_blobs(&self) -> usize;

    fn exact_num_top_blobs(&self) -> usize;

    /// Layer-specific one-time setup: parameter validation and resource creation.
    fn layer_setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()>;

    /// Recomputes output shapes from the bottom shapes and resizes `top`.
    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()>;

    fn forward(&self, bottom: &[Blob], top: &mut [Blob]) -> Result<()>;

    /// `propagate_down` holds one flag per bottom blob; bottoms whose flag is
    /// false are left untouched.
    fn backward(&self, top: &[Blob], propagate_down: &[bool], bottom: &mut [Blob]) -> Result<()>;

    /// Checks blob counts, then runs `layer_setup` followed by `reshape`.
    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        self.check_blob_counts(bottom.len(), top.len())?;
        self.layer_setup(bottom, top)?;
        self.reshape(bottom, top)
    }

    fn check_blob_counts(&self, num_bottom: usize, num_top: usize) -> Result<()> {
        let layer = self.layer_type();
        check_count(layer, "bottom", self.exact_num_bottom_blobs(), num_bottom)?;
        check_count(layer, "top", self.exact_num_top_blobs(), num_top)
    }
}

pub(crate) fn check_count(
    layer: &'static str,
    kind: &'static str,
    expected: usize,
    actual: usize,
) -> Result<()> {
    if expected != actual {
        return Err(LayerError::BlobCount {
            layer,
            kind,
            expected,
            actual,
        });
    }
    Ok(())
}
