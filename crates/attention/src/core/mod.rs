//! Configuration, errors and shared helpers for the attention components.

pub mod config;
pub mod errors;

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

pub use config::{AttentionConfig, AttentionVariant};
pub use errors::AttentionError;

/// Result of constructing an attention component.
pub type BuildResult<T> = std::result::Result<T, AttentionError>;

/// Learned scalar scale and shift applied to a head or cluster output.
#[derive(Debug, Clone)]
pub struct ScaleShift {
    alpha: Tensor,
    beta: Tensor,
}

impl ScaleShift {
    /// Creates `alpha` (init 1) and `beta` (init 0) under `vb`.
    pub fn new(vb: &VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            alpha: vb.get_with_hints(1, "alpha", Init::Const(1.0))?,
            beta: vb.get_with_hints(1, "beta", Init::Const(0.0))?,
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        input.broadcast_mul(&self.alpha)?.broadcast_add(&self.beta)
    }
}

/// `l2_normalize(x) / sqrt(count)`: unit rows shared evenly across `count` slots.
pub(crate) fn normalize_share(input: &Tensor, count: usize) -> Result<Tensor> {
    layers::norm::l2_normalize_last(input)?.affine(1.0 / (count as f64).sqrt(), 0.0)
}
