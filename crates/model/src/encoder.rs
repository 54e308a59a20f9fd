//! Transformer encoder and decoder blocks over frame sequences.
//!
//! Blocks take `(batch, frames, feature_size)` and use post-norm residuals:
//! every sub-layer output is added to its input and layer-normalised.

use attention::{AttentionConfig, MultiHeadAttention};
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use layers::{
    checks,
    linear::expect_chain,
    norm::{LayerNorm, NormSettings},
    residual::{residual_add, Dropout},
    Layer,
};
use serde::{Deserialize, Serialize};

use crate::feed_forward::{FeedForward, FeedForwardBn};

/// A [`Layer`] over `(batch, frames, input_dim)` sequences with a known output width.
pub trait SequenceBlock: Layer {
    fn input_dim(&self) -> usize;
    fn output_dim(&self) -> usize;
}

/// Hyperparameters shared by the transformer blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    pub filter_size: usize,
    #[serde(default)]
    pub attention_dropout: f32,
    #[serde(default)]
    pub relu_dropout: f32,
}

impl TransformerConfig {
    pub fn attention(&self, feature_size: usize) -> AttentionConfig {
        AttentionConfig::new(feature_size, self.hidden_size, self.num_heads)
            .with_dropout(self.attention_dropout)
    }
}

/// `LN(a + FF(a))` with `a = LN(x + MHA(x, x))`.
#[derive(Debug)]
pub struct TransformerEncoder {
    id: String,
    feature_size: usize,
    attention: MultiHeadAttention,
    attention_norm: LayerNorm,
    feed_forward: FeedForward,
    output_norm: LayerNorm,
}

impl TransformerEncoder {
    pub fn new(
        feature_size: usize,
        config: &TransformerConfig,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        Ok(Self {
            id: layers::scope_id(&vb, "encoder"),
            feature_size,
            attention: MultiHeadAttention::new(config.attention(feature_size), norm, vb.pp("attention"))?,
            attention_norm: LayerNorm::new(feature_size, norm, vb.pp("attention_norm"))?,
            feed_forward: FeedForward::new(
                feature_size,
                config.filter_size,
                config.relu_dropout,
                norm,
                vb.pp("feed_forward"),
            )?,
            output_norm: LayerNorm::new(feature_size, norm, vb.pp("output_norm"))?,
        })
    }
}

impl Layer for TransformerEncoder {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("encoder.input", input, self.feature_size)?;
        let attended = self.attention.forward_qk(input, input, train)?;
        let attended = self
            .attention_norm
            .forward(&residual_add("encoder.attention_residual", &attended, input)?)?;
        let ff = self.feed_forward.forward_t(&attended, train)?;
        self.output_norm
            .forward(&residual_add("encoder.ff_residual", &ff, &attended)?)
    }
}

impl SequenceBlock for TransformerEncoder {
    fn input_dim(&self) -> usize {
        self.feature_size
    }

    fn output_dim(&self) -> usize {
        self.feature_size
    }
}

/// Batch-norm encoder: `FFBN(LN(x + dropout(MHA_bn(x, x))))`.
///
/// The attention batch-normalises logits over exactly `max_frames` keys and
/// the block output has `final_size` channels.
#[derive(Debug)]
pub struct TransformerEncoderBn {
    id: String,
    feature_size: usize,
    attention: MultiHeadAttention,
    dropout: Dropout,
    attention_norm: LayerNorm,
    feed_forward: FeedForwardBn,
}

impl TransformerEncoderBn {
    pub fn new(
        feature_size: usize,
        max_frames: usize,
        final_size: usize,
        config: &TransformerConfig,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        let attention_config = config.attention(feature_size).with_batch_norm(max_frames);
        Ok(Self {
            id: layers::scope_id(&vb, "encoder_bn"),
            feature_size,
            attention: MultiHeadAttention::new(attention_config, norm, vb.pp("attention"))?,
            dropout: Dropout::new(config.attention_dropout)?,
            attention_norm: LayerNorm::new(feature_size, norm, vb.pp("attention_norm"))?,
            feed_forward: FeedForwardBn::new(
                feature_size,
                config.filter_size,
                final_size,
                norm,
                vb.pp("feed_forward"),
            )?,
        })
    }
}

impl Layer for TransformerEncoderBn {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let attended = self.attention.forward_qk(input, input, train)?;
        let attended = self.dropout.forward_t(&attended, train)?;
        let attended = self
            .attention_norm
            .forward(&residual_add("encoder_bn.attention_residual", &attended, input)?)?;
        self.feed_forward.forward_t(&attended, train)
    }
}

impl SequenceBlock for TransformerEncoderBn {
    fn input_dim(&self) -> usize {
        self.feature_size
    }

    fn output_dim(&self) -> usize {
        self.feed_forward.final_size()
    }
}

/// Decoder block: self-attention, cross-attention over encoder outputs, then
/// feed-forward, each followed by a residual add and layer norm.
#[derive(Debug)]
pub struct TransformerDecoder {
    id: String,
    feature_size: usize,
    self_attention: MultiHeadAttention,
    self_norm: LayerNorm,
    cross_attention: MultiHeadAttention,
    cross_norm: LayerNorm,
    feed_forward: FeedForward,
    output_norm: LayerNorm,
}

impl TransformerDecoder {
    pub fn new(
        feature_size: usize,
        config: &TransformerConfig,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        Ok(Self {
            id: layers::scope_id(&vb, "decoder"),
            feature_size,
            self_attention: MultiHeadAttention::new(config.attention(feature_size), norm, vb.pp("first_mha"))?,
            self_norm: LayerNorm::new(feature_size, norm, vb.pp("first_norm"))?,
            cross_attention: MultiHeadAttention::new(config.attention(feature_size), norm, vb.pp("second_mha"))?,
            cross_norm: LayerNorm::new(feature_size, norm, vb.pp("second_norm"))?,
            feed_forward: FeedForward::new(
                feature_size,
                config.filter_size,
                config.relu_dropout,
                norm,
                vb.pp("feed_forward"),
            )?,
            output_norm: LayerNorm::new(feature_size, norm, vb.pp("output_norm"))?,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Decodes `inputs` while attending over `encoder_outputs`.
    ///
    /// Both are `(batch, len, feature_size)`; the lengths may differ.
    pub fn forward_t(&self, inputs: &Tensor, encoder_outputs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("decoder.inputs", inputs, self.feature_size)?;
        let first = self.self_attention.forward_qk(inputs, inputs, train)?;
        let first = self
            .self_norm
            .forward(&residual_add("decoder.self_residual", &first, inputs)?)?;
        let second = self
            .cross_attention
            .forward_qk(&first, encoder_outputs, train)?;
        let second = self
            .cross_norm
            .forward(&residual_add("decoder.cross_residual", &second, &first)?)?;
        let ff = self.feed_forward.forward_t(&second, train)?;
        self.output_norm
            .forward(&residual_add("decoder.ff_residual", &ff, &second)?)
    }
}

/// Blocks applied in sequence, scoped `block0`, `block1`, ...
pub struct StackedEncoder {
    id: String,
    blocks: Vec<Box<dyn SequenceBlock>>,
}

impl StackedEncoder {
    /// Builds `count` blocks with `build(index, vb.pp("block{index}"))` and
    /// checks that consecutive widths line up.
    pub fn new<'a, F>(count: usize, vb: VarBuilder<'a>, mut build: F) -> layers::Result<Self>
    where
        F: FnMut(usize, VarBuilder<'a>) -> layers::Result<Box<dyn SequenceBlock>>,
    {
        checks::expect_positive("encoder.num_blocks", count)?;
        let mut blocks: Vec<Box<dyn SequenceBlock>> = Vec::with_capacity(count);
        for index in 0..count {
            let block = build(index, vb.pp(format!("block{index}")))?;
            if let Some(previous) = blocks.last() {
                expect_chain(block.id(), previous.output_dim(), block.input_dim())?;
            }
            blocks.push(block);
        }
        Ok(Self {
            id: layers::scope_id(&vb, "encoder"),
            blocks,
        })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl std::fmt::Debug for StackedEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let blocks: Vec<&str> = self.blocks.iter().map(|block| block.id()).collect();
        f.debug_struct("StackedEncoder")
            .field("id", &self.id)
            .field("blocks", &blocks)
            .finish()
    }
}

impl Layer for StackedEncoder {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        self.blocks
            .iter()
            .try_fold(input.clone(), |hidden, block| block.forward_t(&hidden, train))
    }
}

impl SequenceBlock for StackedEncoder {
    fn input_dim(&self) -> usize {
        self.blocks.first().map_or(0, |block| block.input_dim())
    }

    fn output_dim(&self) -> usize {
        self.blocks.last().map_or(0, |block| block.output_dim())
    }
}
