//! Dense and raw projection layers.
//!
//! [`Dense`] mirrors a fully-connected layer: `activation(x · Wᵀ + b)` with the
//! weight stored Candle-style as `(output_dim, input_dim)`. Inputs may be
//! `(batch, input_dim)` or `(batch, frames, input_dim)`; the leading layout is
//! preserved. [`Projection`] holds a bare `(input_dim, output_dim)` matrix
//! applied as `x · W`, and can apply its transpose for weight tying.
//!
//! Initialisation policies follow the usual recipes: Glorot uniform for dense
//! layers, `N(0, 1/sqrt(fan_in))` for gating matrices, constants for biases.

use candle_core::{Module, Result as CandleResult, Tensor};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::{activations::ActivationKind, checks, LayerError, Result};

/// Weight initialisation policies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LinearInit {
    /// Xavier/Glorot uniform, `U(-b, b)` with `b = sqrt(6 / (fan_in + fan_out))`.
    XavierUniform,
    /// Normal with standard deviation `1 / sqrt(fan_in)`.
    ScaledNormal,
    /// Every entry set to `value`.
    Constant { value: f64 },
}

impl LinearInit {
    /// Resolves the policy into a Candle initialiser for a `(fan_in, fan_out)` matrix.
    pub fn resolve(&self, fan_in: usize, fan_out: usize) -> Init {
        match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out) as f64).sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
            LinearInit::ScaledNormal => Init::Randn {
                mean: 0.0,
                stdev: 1.0 / (fan_in as f64).sqrt(),
            },
            LinearInit::Constant { value } => Init::Const(*value),
        }
    }
}

/// Configuration for a [`Dense`] layer.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    /// Bias initial value; `None` disables the bias.
    pub bias: Option<f64>,
    pub activation: ActivationKind,
    pub init: LinearInit,
}

impl DenseConfig {
    /// Linear layer with zero-initialised bias and Glorot weights.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: Some(0.0),
            activation: ActivationKind::Identity,
            init: LinearInit::XavierUniform,
        }
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }

    pub fn with_bias(mut self, value: f64) -> Self {
        self.bias = Some(value);
        self
    }

    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_init(mut self, init: LinearInit) -> Self {
        self.init = init;
        self
    }
}

/// Fully-connected layer with optional bias and activation.
#[derive(Debug, Clone)]
pub struct Dense {
    config: DenseConfig,
    inner: candle_nn::Linear,
}

impl Dense {
    /// Creates `weight` (and `bias`) under `vb`.
    pub fn new(config: DenseConfig, vb: VarBuilder) -> Result<Self> {
        checks::expect_positive("dense.input_dim", config.input_dim)?;
        checks::expect_positive("dense.output_dim", config.output_dim)?;
        config.activation.validate()?;
        let weight = vb.get_with_hints(
            (config.output_dim, config.input_dim),
            "weight",
            config.init.resolve(config.input_dim, config.output_dim),
        )?;
        let bias = match config.bias {
            Some(value) => Some(vb.get_with_hints(config.output_dim, "bias", Init::Const(value))?),
            None => None,
        };
        Ok(Self {
            inner: candle_nn::Linear::new(weight, bias),
            config,
        })
    }

    pub fn config(&self) -> &DenseConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.inner.weight()
    }

    pub fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        checks::expect_last_dim("dense.input", input, self.config.input_dim)?;
        let projected = self.inner.forward(input)?;
        self.config.activation.apply(&projected)
    }
}

/// Raw learned matrix applied as `x · W`.
#[derive(Debug, Clone)]
pub struct Projection {
    input_dim: usize,
    output_dim: usize,
    weight: Tensor,
}

impl Projection {
    /// Creates a `(input_dim, output_dim)` matrix named `name` under `vb`.
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        init: LinearInit,
        name: &str,
        vb: &VarBuilder,
    ) -> Result<Self> {
        checks::expect_positive("projection.input_dim", input_dim)?;
        checks::expect_positive("projection.output_dim", output_dim)?;
        let weight = vb.get_with_hints(
            (input_dim, output_dim),
            name,
            init.resolve(input_dim, output_dim),
        )?;
        Ok(Self {
            input_dim,
            output_dim,
            weight,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// `x · W`: `(.., input_dim) -> (.., output_dim)`.
    pub fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        checks::expect_last_dim("projection.input", input, self.input_dim)?;
        input.broadcast_matmul(&self.weight)
    }

    /// `x · Wᵀ`: `(.., output_dim) -> (.., input_dim)`, sharing the same storage.
    pub fn transpose_forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        checks::expect_last_dim("projection.transpose_input", input, self.output_dim)?;
        input.broadcast_matmul(&self.weight.t()?)
    }
}

/// Sum of squared entries, the quantity weight regularisers penalise.
pub fn squared_norm(weight: &Tensor) -> CandleResult<Tensor> {
    weight.sqr()?.sum_all()
}

/// Verifies that a producer's output width feeds a consumer's input width.
pub fn expect_chain(context: &str, produced: usize, consumed: usize) -> Result<()> {
    if produced == consumed {
        Ok(())
    } else {
        Err(LayerError::shape_mismatch(
            context,
            format!("input dim {consumed}"),
            format!("upstream output dim {produced}"),
        ))
    }
}
