//! Module containing the execution paths (operators) for unpooling.
//!
//! Each submodule provides one implementation of [`UnpoolingOperator`]. The
//! path a layer uses is decided once, from its [`Engine`] and the capability
//! detected on the running machine.

pub mod backend;
pub mod cpu_backend;
pub mod wgpu_backend;

pub use backend::{resolve_mask, RuntimeError, SliceLayout, UnpoolingOperator};
pub use cpu_backend::CpuUnpooling;
pub use wgpu_backend::WgpuUnpooling;

use crate::params::Engine;

/// Execution path selected for a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Reference,
    Accelerated,
}

/// Resolves the requested engine against what the machine offers.
///
/// `Engine::Default` prefers the accelerated path and silently degrades to the
/// reference path; `Engine::Accelerated` fails when no adapter is present.
pub fn detect_capability(engine: Engine) -> Result<Capability, RuntimeError> {
    match engine {
        Engine::Reference => Ok(Capability::Reference),
        Engine::Accelerated => {
            if pollster::block_on(WgpuUnpooling::adapter_available()) {
                Ok(Capability::Accelerated)
            } else {
                Err(RuntimeError::AcceleratorUnavailable(
                    "engine 'accelerated' was requested but no wgpu adapter was found".to_string(),
                ))
            }
        }
        Engine::Default => {
            if pollster::block_on(WgpuUnpooling::adapter_available()) {
                Ok(Capability::Accelerated)
            } else {
                log::warn!("no wgpu adapter found; falling back to the CPU path");
                Ok(Capability::Reference)
            }
        }
    }
}

/// Builds the operator for `capability`.
///
/// When device creation fails after an adapter was found, `Engine::Default`
/// still degrades to the reference operator.
pub fn instantiate(
    engine: Engine,
    capability: Capability,
) -> Result<Box<dyn UnpoolingOperator>, RuntimeError> {
    match capability {
        Capability::Reference => Ok(Box::new(CpuUnpooling::new())),
        Capability::Accelerated => match pollster::block_on(WgpuUnpooling::new()) {
            Ok(operator) => Ok(Box::new(operator)),
            Err(err) if engine == Engine::Default => {
                log::warn!("wgpu device setup failed ({err}); using the CPU path");
                Ok(Box::new(CpuUnpooling::new()))
            }
            Err(err) => Err(err),
        },
    }
}
