//! Frame pooling for video-level features.
//!
//! Every pooling layer consumes a `(batch, frames, channels)` tensor and
//! collapses the frame axis, returning `(batch, channels)` (or
//! `(batch, 2 * channels)` for [`MaxMeanPooling`]). Layers are built from a
//! [`PoolingConfig`] through [`build_pooling`], which is how the model crate
//! wires them.

pub mod gem;
pub mod reduce;

use candle_nn::VarBuilder;
use layers::{checks, Layer, Result};
use serde::{Deserialize, Serialize};

pub use gem::GemPooling;
pub use reduce::{MaxMeanPooling, MaxPooling, MeanPooling};

/// Reduction applied over the frame axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingMethod {
    Max,
    Mean,
    MaxMean,
    Gem,
}

impl PoolingMethod {
    /// Max-mean pooling normalises both halves unless told otherwise.
    pub fn default_l2_normalize(&self) -> bool {
        matches!(self, PoolingMethod::MaxMean)
    }
}

/// Configuration for a pooling layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolingConfig {
    pub method: PoolingMethod,
    /// Unit-normalise each pooled vector; defaults per method when absent.
    #[serde(default)]
    pub l2_normalize: Option<bool>,
    /// Floor applied before exponentiation in generalized-mean pooling.
    #[serde(default = "default_gem_epsilon")]
    pub epsilon: f64,
    /// Initial value of the learned generalized-mean power.
    #[serde(default = "default_gem_power")]
    pub initial_power: f64,
}

fn default_gem_epsilon() -> f64 {
    1e-6
}

fn default_gem_power() -> f64 {
    3.0
}

impl PoolingConfig {
    pub fn new(method: PoolingMethod) -> Self {
        Self {
            method,
            l2_normalize: None,
            epsilon: default_gem_epsilon(),
            initial_power: default_gem_power(),
        }
    }

    pub fn with_l2_normalize(mut self, enabled: bool) -> Self {
        self.l2_normalize = Some(enabled);
        self
    }

    pub fn l2_normalize(&self) -> bool {
        self.l2_normalize
            .unwrap_or_else(|| self.method.default_l2_normalize())
    }

    /// Width of the pooled vector for `channels` input channels.
    pub fn output_dim(&self, channels: usize) -> usize {
        match self.method {
            PoolingMethod::MaxMean => channels * 2,
            _ => channels,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.method == PoolingMethod::Gem {
            checks::expect_epsilon("pooling.epsilon", self.epsilon)?;
            if !(self.initial_power.is_finite() && self.initial_power > 0.0) {
                return Err(layers::LayerError::invalid(
                    "pooling.initial_power",
                    format!("must be positive, got {}", self.initial_power),
                ));
            }
        }
        Ok(())
    }
}

/// Builds the pooling layer described by `config` for `channels` input channels.
pub fn build_pooling(
    config: &PoolingConfig,
    channels: usize,
    vb: VarBuilder,
) -> Result<Box<dyn Layer>> {
    config.validate()?;
    checks::expect_positive("pooling.channels", channels)?;
    let id = layers::scope_id(&vb, "pooling");
    let l2 = config.l2_normalize();
    log::debug!(
        "pooling {id}: method={:?} channels={channels} l2_normalize={l2}",
        config.method
    );
    let layer: Box<dyn Layer> = match config.method {
        PoolingMethod::Max => Box::new(MaxPooling::new(id, channels, l2)),
        PoolingMethod::Mean => Box::new(MeanPooling::new(id, channels, l2)),
        PoolingMethod::MaxMean => Box::new(MaxMeanPooling::new(id, channels, l2)),
        PoolingMethod::Gem => Box::new(GemPooling::new(
            channels,
            config.epsilon,
            config.initial_power,
            vb,
        )?
        .with_l2_normalize(l2)),
    };
    Ok(layer)
}
