//! Activation catalogue for dense stacks, gates and classifier heads.
//!
//! Activations are elementwise and preserve the input layout.
//!
//! # Built-in formulas
//!
//! * **ReLU6** clips to `[0, 6]`; the correlation gates use it as a bounded
//!   correction term.
//! * **Leaky ReLU** computes `max(x, slope * x)`, which requires
//!   `0 <= slope < 1`; [`ActivationKind::validate`] rejects other slopes.
//! * **Sigmoid** produces per-class probabilities and gate values.

use candle_core::{Result, Tensor};

use crate::LayerError;

/// Slope used by TensorFlow's `leaky_relu` default.
pub const DEFAULT_LEAKY_SLOPE: f64 = 0.2;

/// Identifies which non-linearity a dense layer applies.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ActivationKind {
    /// Identity function (linear output).
    #[default]
    Identity,
    /// Standard rectifier.
    Relu,
    /// Rectifier clipped at 6.
    Relu6,
    /// Leaky rectifier with a configurable negative slope.
    LeakyRelu { negative_slope: f64 },
    /// Logistic sigmoid.
    Sigmoid,
}

impl ActivationKind {
    /// Leaky ReLU with the TensorFlow default slope.
    pub fn leaky_relu() -> Self {
        Self::LeakyRelu {
            negative_slope: DEFAULT_LEAKY_SLOPE,
        }
    }

    /// Leaky ReLU with a checked negative slope.
    pub fn leaky_relu_with_slope(negative_slope: f64) -> crate::Result<Self> {
        let kind = Self::LeakyRelu { negative_slope };
        kind.validate()?;
        Ok(kind)
    }

    pub fn validate(&self) -> crate::Result<()> {
        match self {
            ActivationKind::LeakyRelu { negative_slope }
                if !(0.0..1.0).contains(negative_slope) =>
            {
                Err(LayerError::invalid(
                    "activation.negative_slope",
                    format!("must lie in [0, 1), got {negative_slope}"),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Applies the activation to `input`.
    pub fn apply(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            ActivationKind::Identity => Ok(input.clone()),
            ActivationKind::Relu => input.relu(),
            ActivationKind::Relu6 => input.clamp(0f32, 6f32),
            ActivationKind::LeakyRelu { negative_slope } => {
                let scaled = input.affine(*negative_slope, 0.0)?;
                input.maximum(&scaled)
            }
            ActivationKind::Sigmoid => candle_nn::ops::sigmoid(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn values(tensor: &Tensor) -> Result<Vec<f32>> {
        tensor.flatten_all()?.to_vec1::<f32>()
    }

    #[test]
    fn relu6_clips_both_ends() -> Result<()> {
        let input = Tensor::from_slice(&[-3.0f32, 0.5, 7.5], (3,), &Device::Cpu)?;
        let out = values(&ActivationKind::Relu6.apply(&input)?)?;
        assert_eq!(out, vec![0.0, 0.5, 6.0]);
        Ok(())
    }

    #[test]
    fn leaky_relu_scales_negative_values() -> Result<()> {
        let input = Tensor::from_slice(&[-2.0f32, 0.0, 3.0], (3,), &Device::Cpu)?;
        let out = values(&ActivationKind::leaky_relu().apply(&input)?)?;
        assert!((out[0] + 0.4).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
        assert!((out[2] - 3.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn leaky_slope_must_lie_below_one() {
        assert!(ActivationKind::leaky_relu().validate().is_ok());
        assert!(ActivationKind::leaky_relu_with_slope(0.0).is_ok());
        for slope in [1.0, 1.5, -0.1, f64::NAN] {
            assert!(
                ActivationKind::leaky_relu_with_slope(slope).is_err(),
                "slope {slope}"
            );
        }
    }

    #[test]
    fn sigmoid_matches_reference_formula() -> Result<()> {
        let raw = [-3.0f32, -1.0, 0.0, 0.5, 2.0];
        let input = Tensor::from_slice(&raw, (5,), &Device::Cpu)?;
        let out = values(&ActivationKind::Sigmoid.apply(&input)?)?;
        for (x, y) in raw.iter().zip(out.iter()) {
            let expected = 1.0 / (1.0 + (-x).exp());
            assert!((expected - y).abs() < 1e-6);
        }
        Ok(())
    }
}
