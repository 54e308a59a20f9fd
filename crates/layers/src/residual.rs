//! Residual connections and train-only dropout.
//!
//! Residual branches combine tensors of identical shape. Dropout follows the
//! inverted convention: kept activations are scaled by `1 / (1 - p)` during
//! training and the layer is the identity at evaluation time.

use candle_core::{Result, Tensor};

use crate::{checks, LayerError};

/// Adds `branch` to `residual` after checking both share a shape.
pub fn residual_add(context: &str, branch: &Tensor, residual: &Tensor) -> Result<Tensor> {
    checks::expect_shape(context, branch, residual.dims())?;
    branch.add(residual)
}

/// Dropout that is only active when `train` is set.
#[derive(Debug, Clone)]
pub struct Dropout {
    drop_p: f32,
    inner: candle_nn::Dropout,
}

impl Dropout {
    /// `drop_p` is the probability of zeroing an activation.
    pub fn new(drop_p: f32) -> crate::Result<Self> {
        checks::expect_probability("dropout", drop_p)?;
        Ok(Self {
            drop_p,
            inner: candle_nn::Dropout::new(drop_p),
        })
    }

    /// Builds dropout from a keep probability, the convention used by `tf.nn.dropout`.
    pub fn from_keep_prob(keep_prob: f32) -> crate::Result<Self> {
        if !(keep_prob > 0.0 && keep_prob <= 1.0) {
            return Err(LayerError::invalid(
                "keep_prob",
                format!("must be in (0, 1], got {keep_prob}"),
            ));
        }
        Self::new(1.0 - keep_prob)
    }

    pub fn drop_p(&self) -> f32 {
        self.drop_p
    }

    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.drop_p == 0.0 {
            return Ok(input.clone());
        }
        self.inner.forward(input, train)
    }
}
