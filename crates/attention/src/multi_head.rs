//! Split-head multi-head attention.
//!
//! Queries, keys and values are projected to `hidden_size` without bias, then
//! split into `num_heads` heads of width `hidden_size / num_heads` laid out as
//! `[batch, heads, len, head_dim]`. Scores are computed per head, normalised
//! with a softmax over keys and used to mix the values. Heads are recombined
//! and mapped back to `feature_size` by a dense output transform with bias.

use std::sync::OnceLock;

use candle_core::{Error, Result, Tensor};
use candle_nn::VarBuilder;
use layers::{
    checks,
    linear::{Dense, DenseConfig},
    norm::{apply_optional, maybe_batch_norm, BatchNorm, NormSettings},
    residual::Dropout,
    Layer,
};

use crate::core::{AttentionConfig, AttentionVariant, BuildResult};

#[derive(Debug)]
pub struct MultiHeadAttention {
    id: String,
    config: AttentionConfig,
    q_proj: Dense,
    k_proj: Dense,
    v_proj: Dense,
    output_transform: Dense,
    logits_norm: Option<BatchNorm>,
    output_norm: Option<BatchNorm>,
    dropout: Dropout,
    first_call: OnceLock<()>,
}

impl MultiHeadAttention {
    pub fn new(
        config: AttentionConfig,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> BuildResult<Self> {
        config.validate()?;
        let projection = |name: &str| {
            Dense::new(
                DenseConfig::new(config.feature_size, config.hidden_size).without_bias(),
                vb.pp(name),
            )
        };
        let q_proj = projection("q")?;
        let k_proj = projection("k")?;
        let v_proj = projection("v")?;
        let output_transform = Dense::new(
            DenseConfig::new(config.hidden_size, config.feature_size),
            vb.pp("output_transform"),
        )?;

        let batch_norm = match config.variant {
            AttentionVariant::Standard => None,
            AttentionVariant::BatchNorm { max_frames } => Some(max_frames),
        };
        let logits_norm = match batch_norm {
            Some(max_frames) => maybe_batch_norm(true, max_frames, norm, vb.pp("logits_bn"))?,
            None => None,
        };
        let output_norm =
            maybe_batch_norm(batch_norm.is_some(), config.hidden_size, norm, vb.pp("attention_bn"))?;

        let id = layers::scope_id(&vb, "multi_head_attention");
        log::debug!(
            "attention {id}: feature_size={} hidden_size={} heads={} head_dim={} variant={:?}",
            config.feature_size,
            config.hidden_size,
            config.num_heads,
            config.head_dim(),
            config.variant
        );

        Ok(Self {
            id,
            dropout: Dropout::new(config.dropout)?,
            config,
            q_proj,
            k_proj,
            v_proj,
            output_transform,
            logits_norm,
            output_norm,
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// `(batch, len, hidden)` to `(batch, heads, len, head_dim)`.
    fn split_heads(&self, input: &Tensor) -> Result<Tensor> {
        let (batch, len, _) = input.dims3()?;
        input
            .reshape((batch, len, self.config.num_heads, self.config.head_dim()))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `(batch, heads, len, head_dim)` back to `(batch, len, hidden)`.
    fn combine_heads(&self, input: &Tensor) -> Result<Tensor> {
        let (batch, _, len, _) = input.dims4()?;
        input
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, len, self.config.hidden_size))
    }

    fn check_inputs(&self, queries: &Tensor, keys: &Tensor) -> Result<()> {
        let feature_size = self.config.feature_size;
        checks::expect_batch_seq_hidden("attention.queries", queries, feature_size)?;
        checks::expect_batch_seq_hidden("attention.keys", keys, feature_size)?;
        let (q_batch, k_batch) = (queries.dim(0)?, keys.dim(0)?);
        if q_batch != k_batch {
            return Err(Error::Msg(format!(
                "attention: queries batch {q_batch} does not match keys batch {k_batch}"
            )));
        }
        if let AttentionVariant::BatchNorm { max_frames } = self.config.variant {
            let k_len = keys.dim(1)?;
            if k_len != max_frames {
                return Err(Error::Msg(format!(
                    "attention.keys: batch-norm variant expects {max_frames} frames, got {k_len}"
                )));
            }
        }
        Ok(())
    }

    /// Softmax attention weights, shaped `(batch, heads, q_len, k_len)`.
    pub fn attention_weights(&self, queries: &Tensor, keys: &Tensor, train: bool) -> Result<Tensor> {
        self.check_inputs(queries, keys)?;
        let q = self.split_heads(&self.q_proj.forward(queries)?)?;
        let k = self.split_heads(&self.k_proj.forward(keys)?)?;
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let k_len = k.dim(2)?;

        let q = match self.config.variant {
            AttentionVariant::Standard => q.affine((head_dim as f64).powf(-0.5), 0.0)?,
            AttentionVariant::BatchNorm { .. } => q,
        };

        let merged = batch * heads;
        let q_view = q.reshape((merged, q_len, head_dim))?;
        let k_t = k.reshape((merged, k_len, head_dim))?.transpose(1, 2)?;
        let logits = q_view.matmul(&k_t)?.reshape((batch, heads, q_len, k_len))?;
        let logits = apply_optional(self.logits_norm.as_ref(), &logits, train)?;
        candle_nn::ops::softmax_last_dim(&logits)
    }

    /// Value projection of `keys`, before the heads are split.
    pub fn project_values(&self, keys: &Tensor) -> Result<Tensor> {
        self.v_proj.forward(keys)
    }

    /// Attention-weighted mix of the projected values with heads combined,
    /// before the output norm and transform.
    pub fn attend(&self, queries: &Tensor, keys: &Tensor, train: bool) -> Result<Tensor> {
        let weights = self.attention_weights(queries, keys, train)?;
        let weights = self.dropout.forward_t(&weights, train)?;
        let v = self.split_heads(&self.project_values(keys)?)?;

        let (batch, heads, q_len, k_len) = weights.dims4()?;
        let head_dim = self.config.head_dim();
        let merged = batch * heads;
        let mixed = weights
            .reshape((merged, q_len, k_len))?
            .matmul(&v.reshape((merged, k_len, head_dim))?)?
            .reshape((batch, heads, q_len, head_dim))?;
        self.combine_heads(&mixed)
    }

    /// Attention of `queries` over `keys`, which also supply the values.
    ///
    /// Returns `(batch, q_len, feature_size)`.
    pub fn forward_qk(&self, queries: &Tensor, keys: &Tensor, train: bool) -> Result<Tensor> {
        if self.first_call.set(()).is_ok() {
            log::debug!(
                "attention {} first call: queries={:?} keys={:?} train={train}",
                self.id,
                queries.dims(),
                keys.dims()
            );
        }
        let combined = self.attend(queries, keys, train)?;
        let combined = apply_optional(self.output_norm.as_ref(), &combined, train)?;
        self.output_transform.forward(&combined)
    }
}

impl Layer for MultiHeadAttention {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_qk(input, input, train)
    }
}
