//! Attention-cluster pooling: a fixed number of attention units each pool the
//! frame sequence into one slot.
//!
//! Input is `(batch, max_frames, feature)`; output is
//! `(batch, num_clusters, feature)`. The frame count must equal `max_frames`
//! because the attention logits are a dense projection onto that many
//! positions.

use candle_core::{Error, Result, Tensor, D};
use candle_nn::VarBuilder;
use layers::{
    checks,
    linear::{Dense, DenseConfig},
    norm::{LayerNorm, NormSettings},
    Layer,
};
use serde::{Deserialize, Serialize};

use crate::core::{normalize_share, AttentionError, BuildResult, ScaleShift};

/// Whether each cluster projects its inputs before attending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAttentionKind {
    /// Per-cluster key/value projections, then a shared dense layer and layer norm.
    #[default]
    Projected,
    /// Attend directly over the inputs and return the concatenated slots.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAttentionConfig {
    pub feature_size: usize,
    pub max_frames: usize,
    pub num_clusters: usize,
    #[serde(default)]
    pub kind: ClusterAttentionKind,
}

impl ClusterAttentionConfig {
    pub fn new(feature_size: usize, max_frames: usize, num_clusters: usize) -> Self {
        Self {
            feature_size,
            max_frames,
            num_clusters,
            kind: ClusterAttentionKind::Projected,
        }
    }

    pub fn with_kind(mut self, kind: ClusterAttentionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), AttentionError> {
        for (field, value) in [
            ("feature_size", self.feature_size),
            ("max_frames", self.max_frames),
            ("num_clusters", self.num_clusters),
        ] {
            if value == 0 {
                return Err(AttentionError::invalid(field, "must be greater than zero"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Cluster {
    keys: Option<Dense>,
    values: Option<Dense>,
    attention: Dense,
    scale_shift: ScaleShift,
}

impl Cluster {
    fn new(config: &ClusterAttentionConfig, vb: VarBuilder) -> BuildResult<Self> {
        let feature = config.feature_size;
        let (keys, values) = match config.kind {
            ClusterAttentionKind::Projected => (
                Some(Dense::new(DenseConfig::new(feature, feature).without_bias(), vb.pp("k"))?),
                Some(Dense::new(DenseConfig::new(feature, feature).without_bias(), vb.pp("v"))?),
            ),
            ClusterAttentionKind::Direct => (None, None),
        };
        Ok(Self {
            keys,
            values,
            attention: Dense::new(DenseConfig::new(feature, config.max_frames), vb.pp("attention"))?,
            scale_shift: ScaleShift::new(&vb)?,
        })
    }

    /// One slot, `(batch, 1, feature)`.
    fn forward(&self, input: &Tensor, num_clusters: usize) -> Result<Tensor> {
        let keys = match &self.keys {
            Some(dense) => dense.forward(input)?,
            None => input.clone(),
        };
        let values = match &self.values {
            Some(dense) => dense.forward(input)?,
            None => input.clone(),
        };
        let feature = input.dim(D::Minus1)?;
        let logits = self
            .attention
            .forward(&keys)?
            .affine(1.0 / (feature as f64).sqrt(), 0.0)?;
        let weights = candle_nn::ops::softmax_last_dim(&logits)?;
        let pooled = weights.matmul(&values)?.mean_keepdim(1)?;
        normalize_share(&self.scale_shift.forward(&pooled)?, num_clusters)
    }
}

#[derive(Debug, Clone)]
pub struct ClusterAttention {
    id: String,
    config: ClusterAttentionConfig,
    clusters: Vec<Cluster>,
    output: Option<(Dense, LayerNorm)>,
}

impl ClusterAttention {
    pub fn new(
        config: ClusterAttentionConfig,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> BuildResult<Self> {
        config.validate()?;
        let clusters = (0..config.num_clusters)
            .map(|i| Cluster::new(&config, vb.pp(format!("cluster{i}"))))
            .collect::<BuildResult<Vec<_>>>()?;
        let output = match config.kind {
            ClusterAttentionKind::Projected => Some((
                Dense::new(
                    DenseConfig::new(config.feature_size, config.feature_size).without_bias(),
                    vb.pp("output"),
                )?,
                LayerNorm::new(config.feature_size, norm, vb.pp("output_norm"))?,
            )),
            ClusterAttentionKind::Direct => None,
        };
        let id = layers::scope_id(&vb, "cluster_attention");
        log::debug!(
            "cluster attention {id}: feature_size={} max_frames={} clusters={} kind={:?}",
            config.feature_size,
            config.max_frames,
            config.num_clusters,
            config.kind
        );
        Ok(Self {
            id,
            config,
            clusters,
            output,
        })
    }

    pub fn config(&self) -> &ClusterAttentionConfig {
        &self.config
    }
}

fn expect_max_frames(context: &str, input: &Tensor, max_frames: usize) -> Result<()> {
    let frames = input.dim(1)?;
    if frames == max_frames {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected {max_frames} frames, got {frames}"
        )))
    }
}

impl Layer for ClusterAttention {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        let context = "cluster_attention.input";
        checks::expect_batch_seq_hidden(context, input, self.config.feature_size)?;
        expect_max_frames(context, input, self.config.max_frames)?;
        let slots = self
            .clusters
            .iter()
            .map(|cluster| cluster.forward(input, self.clusters.len()))
            .collect::<Result<Vec<_>>>()?;
        let slots = Tensor::cat(&slots, 1)?;
        match &self.output {
            Some((dense, norm)) => norm.forward(&dense.forward(&slots)?),
            None => Ok(slots),
        }
    }
}

/// Single dense layer producing one attention distribution per cluster.
///
/// Logits `(batch, frames, num_clusters)` are scaled by `1/sqrt(feature)` and
/// normalised over frames; each cluster slot is the attention-weighted sum of
/// frames, projected by a dense layer, unit-normalised and divided by
/// `sqrt(num_clusters)`. Any frame count is accepted.
#[derive(Debug, Clone)]
pub struct SingleFcClusterAttention {
    id: String,
    feature_size: usize,
    num_clusters: usize,
    attention: Dense,
    output: Dense,
}

impl SingleFcClusterAttention {
    pub fn new(feature_size: usize, num_clusters: usize, vb: VarBuilder) -> BuildResult<Self> {
        if num_clusters == 0 {
            return Err(AttentionError::invalid("num_clusters", "must be greater than zero"));
        }
        Ok(Self {
            id: layers::scope_id(&vb, "single_fc_cluster_attention"),
            feature_size,
            num_clusters,
            attention: Dense::new(DenseConfig::new(feature_size, num_clusters), vb.pp("attention"))?,
            output: Dense::new(DenseConfig::new(feature_size, feature_size), vb.pp("output"))?,
        })
    }

    /// Attention over frames, `(batch, num_clusters, frames)`; rows sum to 1.
    pub fn attention_weights(&self, input: &Tensor) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("single_fc_cluster_attention.input", input, self.feature_size)?;
        let logits = self
            .attention
            .forward(input)?
            .affine(1.0 / (self.feature_size as f64).sqrt(), 0.0)?
            .transpose(1, 2)?
            .contiguous()?;
        candle_nn::ops::softmax_last_dim(&logits)
    }
}

impl Layer for SingleFcClusterAttention {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        let pooled = self.attention_weights(input)?.matmul(input)?;
        normalize_share(&self.output.forward(&pooled)?, self.num_clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn slot_norms(out: &Tensor) -> Result<Vec<f32>> {
        out.sqr()?.sum(D::Minus1)?.sqrt()?.flatten_all()?.to_vec1::<f32>()
    }

    #[test]
    fn direct_clusters_return_normalised_slots() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ClusterAttentionConfig::new(6, 5, 4).with_kind(ClusterAttentionKind::Direct);
        let layer = ClusterAttention::new(config, &NormSettings::default(), vb.pp("crazy"))?;
        let input = Tensor::randn(0f32, 1.0, (2, 5, 6), &Device::Cpu)?;
        let out = layer.forward_t(&input, false)?;
        assert_eq!(out.dims(), &[2, 4, 6]);
        assert!(slot_norms(&out)?.iter().all(|n| (n - 0.5).abs() < 1e-5));
        // per cluster: attention weight + bias, alpha, beta
        assert_eq!(varmap.all_vars().len(), 4 * 4);
        Ok(())
    }

    #[test]
    fn projected_clusters_map_frames_to_slots() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = ClusterAttention::new(
            ClusterAttentionConfig::new(8, 6, 3),
            &NormSettings::default(),
            vb.pp("one_attention"),
        )?;
        assert_eq!(layer.id(), "one_attention");
        let input = Tensor::randn(0f32, 1.0, (2, 6, 8), &Device::Cpu)?;
        assert_eq!(layer.forward_t(&input, true)?.dims(), &[2, 3, 8]);
        Ok(())
    }

    #[test]
    fn frame_count_must_match_max_frames() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = ClusterAttention::new(ClusterAttentionConfig::new(4, 6, 2), &NormSettings::default(), vb)?;
        let input = Tensor::zeros((1, 5, 4), DType::F32, &Device::Cpu)?;
        let err = layer.forward_t(&input, false).unwrap_err().to_string();
        assert!(err.contains("expected 6 frames, got 5"), "{err}");
        Ok(())
    }

    #[test]
    fn single_fc_weights_are_distributions_over_frames() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = SingleFcClusterAttention::new(4, 3, vb)?;
        let input = Tensor::randn(0f32, 1.0, (2, 7, 4), &Device::Cpu)?;
        let weights = layer.attention_weights(&input)?;
        assert_eq!(weights.dims(), &[2, 3, 7]);
        let sums = weights.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        assert_eq!(layer.forward_t(&input, false)?.dims(), &[2, 3, 4]);
        Ok(())
    }
}
