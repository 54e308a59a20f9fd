//! Composite cluster block.
//!
//! Per-head self-attention over frames, a feed-forward sub-block, attention
//! pooling into `num_clusters` slots and a second feed-forward sub-block:
//! `(batch, max_frames, feature) -> (batch, num_clusters, feature)`.

use attention::{ClusterAttention, ClusterAttentionConfig, PerHeadAttention};
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use layers::{checks, norm::NormSettings, Layer};
use serde::{Deserialize, Serialize};

use crate::{encoder::SequenceBlock, feed_forward::FeedForward};

/// Relu dropout used inside the block's feed-forward sub-layers.
pub const CLUSTER_BLOCK_RELU_DROPOUT: f32 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterBlockConfig {
    pub filter_size: usize,
    /// Number of cluster slots; also the number of self-attention heads.
    pub num_clusters: usize,
    /// Width of each attention head's projections.
    pub num_units: usize,
}

#[derive(Debug)]
pub struct ClusterBlock {
    id: String,
    feature_size: usize,
    max_frames: usize,
    multi_head: PerHeadAttention,
    ff1: FeedForward,
    clusters: ClusterAttention,
    ff2: FeedForward,
}

impl ClusterBlock {
    pub fn new(
        feature_size: usize,
        max_frames: usize,
        config: &ClusterBlockConfig,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        let id = layers::scope_id(&vb, "cluster_block");
        log::debug!(
            "cluster block {id}: {max_frames} frames -> {} clusters of {feature_size}",
            config.num_clusters
        );
        Ok(Self {
            multi_head: PerHeadAttention::new(
                feature_size,
                config.num_clusters,
                config.num_units,
                norm,
                vb.pp("multi_head"),
            )?,
            ff1: FeedForward::new(
                feature_size,
                config.filter_size,
                CLUSTER_BLOCK_RELU_DROPOUT,
                norm,
                vb.pp("ff1"),
            )?,
            clusters: ClusterAttention::new(
                ClusterAttentionConfig::new(feature_size, max_frames, config.num_clusters),
                norm,
                vb.pp("one_attention"),
            )?,
            ff2: FeedForward::new(
                feature_size,
                config.filter_size,
                CLUSTER_BLOCK_RELU_DROPOUT,
                norm,
                vb.pp("ff2"),
            )?,
            id,
            feature_size,
            max_frames,
        })
    }

    pub fn num_clusters(&self) -> usize {
        self.clusters.config().num_clusters
    }

    /// Frame count this block accepts.
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }
}

impl Layer for ClusterBlock {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("cluster_block.input", input, self.feature_size)?;
        let attended = self.multi_head.forward_t(input, train)?;
        let filtered = self.ff1.forward_t(&attended, train)?;
        let slots = self.clusters.forward_t(&filtered, train)?;
        self.ff2.forward_t(&slots, train)
    }
}

impl SequenceBlock for ClusterBlock {
    fn input_dim(&self) -> usize {
        self.feature_size
    }

    fn output_dim(&self) -> usize {
        self.feature_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn maps_frames_to_cluster_slots() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ClusterBlockConfig {
            filter_size: 12,
            num_clusters: 3,
            num_units: 4,
        };
        let block = ClusterBlock::new(6, 5, &config, &NormSettings::default(), vb.pp("block0"))?;
        assert_eq!(block.num_clusters(), 3);
        assert_eq!(block.max_frames(), 5);
        let input = Tensor::randn(0f32, 1.0, (2, 5, 6), &Device::Cpu)?;
        assert_eq!(block.forward_t(&input, true)?.dims(), &[2, 3, 6]);
        Ok(())
    }

    #[test]
    fn rejects_wrong_frame_count() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ClusterBlockConfig {
            filter_size: 8,
            num_clusters: 2,
            num_units: 4,
        };
        let block = ClusterBlock::new(4, 6, &config, &NormSettings::default(), vb)?;
        let input = Tensor::randn(0f32, 1.0, (1, 5, 4), &Device::Cpu)?;
        assert!(block.forward_t(&input, false).is_err());
        Ok(())
    }
}
