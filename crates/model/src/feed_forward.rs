//! Position-wise feed-forward sub-blocks.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use layers::{
    activations::ActivationKind,
    checks,
    linear::{Dense, DenseConfig},
    norm::{BatchNorm, LayerNorm, NormSettings},
    residual::{residual_add, Dropout},
    Layer,
};

/// `LN(x + relu(W2 · dropout(relu(W1 · x))))`.
///
/// The filter layer widens to `filter_size`; the output layer maps back to
/// `feature_size` so the residual lines up.
#[derive(Debug, Clone)]
pub struct FeedForward {
    id: String,
    filter: Dense,
    output: Dense,
    relu_dropout: Dropout,
    norm: LayerNorm,
}

impl FeedForward {
    pub fn new(
        feature_size: usize,
        filter_size: usize,
        relu_dropout: f32,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        Ok(Self {
            id: layers::scope_id(&vb, "feed_forward"),
            filter: Dense::new(
                DenseConfig::new(feature_size, filter_size).with_activation(ActivationKind::Relu),
                vb.pp("filter"),
            )?,
            output: Dense::new(
                DenseConfig::new(filter_size, feature_size).with_activation(ActivationKind::Relu),
                vb.pp("output"),
            )?,
            relu_dropout: Dropout::new(relu_dropout)?,
            norm: LayerNorm::new(feature_size, norm, vb.pp("norm"))?,
        })
    }

    pub fn feature_size(&self) -> usize {
        self.output.config().output_dim
    }
}

impl Layer for FeedForward {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let filtered = self
            .relu_dropout
            .forward_t(&self.filter.forward(input)?, train)?;
        let output = self.output.forward(&filtered)?;
        self.norm.forward(&residual_add("feed_forward.residual", &output, input)?)
    }
}

/// Feed-forward variant with batch norm after each dense layer and no residual.
///
/// Output width is `final_size`, which may differ from the input width.
#[derive(Debug, Clone)]
pub struct FeedForwardBn {
    id: String,
    filter: Dense,
    filter_norm: BatchNorm,
    output: Dense,
    output_norm: BatchNorm,
}

impl FeedForwardBn {
    pub fn new(
        feature_size: usize,
        filter_size: usize,
        final_size: usize,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        Ok(Self {
            id: layers::scope_id(&vb, "feed_forward_bn"),
            filter: Dense::new(
                DenseConfig::new(feature_size, filter_size).with_activation(ActivationKind::Relu),
                vb.pp("filter"),
            )?,
            filter_norm: BatchNorm::new(filter_size, norm, vb.pp("filter_bn"))?,
            output: Dense::new(
                DenseConfig::new(filter_size, final_size).with_activation(ActivationKind::Relu),
                vb.pp("output"),
            )?,
            output_norm: BatchNorm::new(final_size, norm, vb.pp("output_bn"))?,
        })
    }

    pub fn final_size(&self) -> usize {
        self.output_norm.num_features()
    }
}

impl Layer for FeedForwardBn {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_rank("feed_forward_bn.input", input, 3)?;
        let filtered = self
            .filter_norm
            .forward_t(&self.filter.forward(input)?, train)?;
        self.output_norm
            .forward_t(&self.output.forward(&filtered)?, train)
    }
}
