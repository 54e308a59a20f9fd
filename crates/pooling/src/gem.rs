//! Generalized-mean pooling with a learned power.
//!
//! `out = mean_t(max(x, eps)^p)^(1/p)` per channel. `p = 1` reduces to the
//! mean of the clamped input and large `p` approaches max pooling. The power
//! is a single scalar parameter named `p` under the layer's scope. The
//! pooled vector is optionally L2-normalized along channels.

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};
use layers::{checks, norm::l2_normalize_last, Layer};

#[derive(Debug, Clone)]
pub struct GemPooling {
    id: String,
    channels: usize,
    epsilon: f64,
    power: Tensor,
    l2_normalize: bool,
}

impl GemPooling {
    pub fn new(
        channels: usize,
        epsilon: f64,
        initial_power: f64,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        checks::expect_positive("gem.channels", channels)?;
        checks::expect_epsilon("gem.epsilon", epsilon)?;
        let power = vb.get_with_hints(1, "p", Init::Const(initial_power))?;
        Ok(Self {
            id: layers::scope_id(&vb, "gem"),
            channels,
            epsilon,
            power,
            l2_normalize: false,
        })
    }

    pub fn with_l2_normalize(mut self, enabled: bool) -> Self {
        self.l2_normalize = enabled;
        self
    }

    /// The learned exponent, shape `(1,)`.
    pub fn power(&self) -> &Tensor {
        &self.power
    }
}

impl Layer for GemPooling {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("gem_pooling.input", input, self.channels)?;
        // x^p computed as exp(p * ln x); the clamp keeps the log finite.
        let raised = input
            .maximum(self.epsilon)?
            .log()?
            .broadcast_mul(&self.power)?
            .exp()?;
        let pooled = raised.mean(1)?.log()?.broadcast_div(&self.power)?.exp()?;
        if self.l2_normalize {
            l2_normalize_last(&pooled)
        } else {
            Ok(pooled)
        }
    }
}
