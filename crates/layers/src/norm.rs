//! Normalisation layers bundled with unified shape handling.
//!
//! All normalisation here happens along the last axis while preserving the
//! original layout, matching how feature vectors are laid out throughout the
//! workspace (`(batch, channels)`, `(batch, frames, channels)` and attention
//! logits `(batch, heads, queries, keys)`).
//!
//! [`BatchNorm`] wraps Candle's batch norm, which expects channels on axis 1,
//! by swapping the last axis into that position and back. In training mode it
//! normalises with batch statistics and updates the running averages; in
//! evaluation mode it uses the running averages.

use candle_core::{Module, ModuleT, Result as CandleResult, Tensor, D};
use candle_nn::{BatchNormConfig, LayerNormConfig, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::{checks, Result};

/// Floor used by `l2_normalize`, matching TensorFlow's default.
pub const L2_EPSILON: f64 = 1e-12;

/// Epsilons and momentum shared by every normalisation layer in a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormSettings {
    pub layer_norm_epsilon: f64,
    pub batch_norm_epsilon: f64,
    /// Weight of the current batch when updating running statistics.
    pub batch_norm_momentum: f64,
}

impl Default for NormSettings {
    fn default() -> Self {
        Self {
            layer_norm_epsilon: 1e-12,
            batch_norm_epsilon: 1e-3,
            batch_norm_momentum: 0.1,
        }
    }
}

impl NormSettings {
    pub fn validate(&self) -> Result<()> {
        checks::expect_epsilon("norm.layer_norm_epsilon", self.layer_norm_epsilon)?;
        checks::expect_epsilon("norm.batch_norm_epsilon", self.batch_norm_epsilon)?;
        if !(self.batch_norm_momentum > 0.0 && self.batch_norm_momentum <= 1.0) {
            return Err(crate::LayerError::invalid(
                "norm.batch_norm_momentum",
                format!("must be in (0, 1], got {}", self.batch_norm_momentum),
            ));
        }
        Ok(())
    }
}

/// Layer normalisation over the last axis with learnable scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    hidden_size: usize,
    inner: candle_nn::LayerNorm,
}

impl LayerNorm {
    pub fn new(hidden_size: usize, settings: &NormSettings, vb: VarBuilder) -> Result<Self> {
        checks::expect_positive("layer_norm.hidden_size", hidden_size)?;
        let config = LayerNormConfig {
            eps: settings.layer_norm_epsilon,
            ..LayerNormConfig::default()
        };
        let inner = candle_nn::layer_norm(hidden_size, config, vb)?;
        Ok(Self { hidden_size, inner })
    }

    pub fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        checks::expect_last_dim("layer_norm.input", input, self.hidden_size)?;
        self.inner.forward(input)
    }
}

/// Batch normalisation over the last axis.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    num_features: usize,
    inner: candle_nn::BatchNorm,
}

impl BatchNorm {
    pub fn new(num_features: usize, settings: &NormSettings, vb: VarBuilder) -> Result<Self> {
        checks::expect_positive("batch_norm.num_features", num_features)?;
        let config = BatchNormConfig {
            eps: settings.batch_norm_epsilon,
            remove_mean: true,
            affine: true,
            momentum: settings.batch_norm_momentum,
        };
        let inner = candle_nn::batch_norm(num_features, config, vb)?;
        Ok(Self {
            num_features,
            inner,
        })
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn forward_t(&self, input: &Tensor, train: bool) -> CandleResult<Tensor> {
        checks::expect_last_dim("batch_norm.input", input, self.num_features)?;
        let rank = input.rank();
        match rank {
            2 => self.inner.forward_t(input, train),
            3 | 4 => {
                let moved = input.transpose(1, rank - 1)?.contiguous()?;
                let normed = self.inner.forward_t(&moved, train)?;
                normed.transpose(1, rank - 1)?.contiguous()
            }
            _ => Err(candle_core::Error::Msg(format!(
                "batch_norm.input: expected rank 2, 3 or 4, got shape {:?}",
                input.dims()
            ))),
        }
    }
}

/// Optional batch norm, used by components whose normalisation is a switch.
pub fn maybe_batch_norm(
    enabled: bool,
    num_features: usize,
    settings: &NormSettings,
    vb: VarBuilder,
) -> Result<Option<BatchNorm>> {
    if enabled {
        Ok(Some(BatchNorm::new(num_features, settings, vb)?))
    } else {
        Ok(None)
    }
}

/// Applies an optional batch norm, passing the input through when absent.
pub fn apply_optional(norm: Option<&BatchNorm>, input: &Tensor, train: bool) -> CandleResult<Tensor> {
    match norm {
        Some(norm) => norm.forward_t(input, train),
        None => Ok(input.clone()),
    }
}

/// `x / sqrt(max(sum(x²), eps))` along `dim`.
pub fn l2_normalize<T: candle_core::shape::Dim>(input: &Tensor, dim: T) -> CandleResult<Tensor> {
    let squared = input.sqr()?.sum_keepdim(dim)?;
    let norm = squared.maximum(L2_EPSILON)?.sqrt()?;
    input.broadcast_div(&norm)
}

/// L2 normalisation along the last axis.
pub fn l2_normalize_last(input: &Tensor) -> CandleResult<Tensor> {
    l2_normalize(input, D::Minus1)
}
