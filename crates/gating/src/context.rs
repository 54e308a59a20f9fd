//! Context gating: reweight each feature by a mask computed from all features.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use layers::{
    activations::ActivationKind,
    checks,
    linear::{Dense, DenseConfig, LinearInit, Projection},
    norm::{apply_optional, maybe_batch_norm, BatchNorm, NormSettings},
    Layer,
};

/// `sigmoid(BN(x · W)) ⊙ x` with a square gating matrix.
#[derive(Debug, Clone)]
pub struct ContextGate {
    id: String,
    gate: Projection,
    norm: Option<BatchNorm>,
}

impl ContextGate {
    pub fn new(dim: usize, batch_norm: bool, settings: &NormSettings, vb: VarBuilder) -> layers::Result<Self> {
        let gate = Projection::new(dim, dim, LinearInit::ScaledNormal, "gate_weights", &vb)?;
        let norm = maybe_batch_norm(batch_norm, dim, settings, vb.pp("gate_bn"))?;
        Ok(Self {
            id: layers::scope_id(&vb, "context_gate"),
            gate,
            norm,
        })
    }

    /// The sigmoid mask before it is applied to the input.
    pub fn mask(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_batch_vector("context_gate.input", input, self.gate.input_dim())?;
        let logits = apply_optional(self.norm.as_ref(), &self.gate.forward(input)?, train)?;
        candle_nn::ops::sigmoid(&logits)
    }
}

impl Layer for ContextGate {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        input.mul(&self.mask(input, train)?)
    }
}

/// Three-layer perceptron whose final sigmoid activation is the output.
///
/// Unlike [`ContextGate`] the mask replaces the input instead of scaling it.
#[derive(Debug, Clone)]
pub struct MlpGate {
    id: String,
    layers: [Dense; 3],
}

impl MlpGate {
    pub fn new(dim: usize, vb: VarBuilder) -> layers::Result<Self> {
        let layer = |name: &str, activation| {
            Dense::new(DenseConfig::new(dim, dim).with_activation(activation), vb.pp(name))
        };
        Ok(Self {
            id: layers::scope_id(&vb, "mlp_gate"),
            layers: [
                layer("fc1", ActivationKind::Relu)?,
                layer("fc2", ActivationKind::Relu)?,
                layer("fc3", ActivationKind::Sigmoid)?,
            ],
        })
    }
}

impl Layer for MlpGate {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        checks::expect_batch_vector("mlp_gate.input", input, self.layers[0].config().input_dim)?;
        self.layers
            .iter()
            .try_fold(input.clone(), |hidden, layer| layer.forward(&hidden))
    }
}

/// Gating in an expanded space, projected back with the transposed expansion.
///
/// `a = BN(x · C)`, `g = sigmoid(BN(a · G))`, output `(a ⊙ g) · Cᵀ`.
#[derive(Debug, Clone)]
pub struct ExpandedGate {
    id: String,
    expand: Projection,
    expand_norm: Option<BatchNorm>,
    gate: Projection,
    gate_norm: Option<BatchNorm>,
}

impl ExpandedGate {
    pub fn new(
        dim: usize,
        cluster_size: usize,
        batch_norm: bool,
        settings: &NormSettings,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        let expand = Projection::new(dim, cluster_size, LinearInit::ScaledNormal, "cluster_weights", &vb)?;
        let gate = Projection::new(
            cluster_size,
            cluster_size,
            LinearInit::ScaledNormal,
            "gate_weights",
            &vb,
        )?;
        Ok(Self {
            id: layers::scope_id(&vb, "expanded_gate"),
            expand_norm: maybe_batch_norm(batch_norm, cluster_size, settings, vb.pp("cluster_bn"))?,
            gate_norm: maybe_batch_norm(batch_norm, cluster_size, settings, vb.pp("gate_bn"))?,
            expand,
            gate,
        })
    }

    pub fn cluster_size(&self) -> usize {
        self.expand.output_dim()
    }
}

impl Layer for ExpandedGate {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_batch_vector("expanded_gate.input", input, self.expand.input_dim())?;
        let activation = apply_optional(self.expand_norm.as_ref(), &self.expand.forward(input)?, train)?;
        let logits = apply_optional(self.gate_norm.as_ref(), &self.gate.forward(&activation)?, train)?;
        let gated = activation.mul(&candle_nn::ops::sigmoid(&logits)?)?;
        self.expand.transpose_forward(&gated)
    }
}
