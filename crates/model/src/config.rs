use std::{fs, path::Path};

use gating::GateConfig;
use layers::norm::NormSettings;
use pooling::PoolingConfig;
use serde::{Deserialize, Serialize};

use crate::{
    block::ClusterBlockConfig,
    encoder::TransformerConfig,
    error::{ModelError, Result},
    heads::HeadConfig,
};

fn default_num_blocks() -> usize {
    1
}

/// Frame encoder applied before pooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EncoderConfig {
    Transformer {
        transformer: TransformerConfig,
        #[serde(default = "default_num_blocks")]
        num_blocks: usize,
    },
    /// Batch-norm attention over exactly `max_frames` frames. The first block
    /// maps `feature_size` to `final_size`; later blocks keep `final_size`.
    TransformerBn {
        transformer: TransformerConfig,
        final_size: usize,
        #[serde(default = "default_num_blocks")]
        num_blocks: usize,
    },
    /// Cluster blocks. The first block consumes `max_frames` frames; later
    /// blocks consume the `num_clusters` slots of the previous one.
    ClusterBlock {
        block: ClusterBlockConfig,
        #[serde(default = "default_num_blocks")]
        num_blocks: usize,
    },
}

impl EncoderConfig {
    pub fn num_blocks(&self) -> usize {
        match self {
            EncoderConfig::Transformer { num_blocks, .. }
            | EncoderConfig::TransformerBn { num_blocks, .. }
            | EncoderConfig::ClusterBlock { num_blocks, .. } => *num_blocks,
        }
    }

    /// Channel width of the encoded sequence.
    pub fn output_dim(&self, feature_size: usize) -> usize {
        match self {
            EncoderConfig::TransformerBn { final_size, .. } => *final_size,
            _ => feature_size,
        }
    }

    fn collect_errors(&self, feature_size: usize, max_frames: usize, errors: &mut Vec<String>) {
        if self.num_blocks() == 0 {
            errors.push("encoder.num_blocks must be greater than 0".to_string());
        }
        match self {
            EncoderConfig::Transformer { transformer, .. } => {
                transformer_errors(transformer, feature_size, None, errors);
            }
            EncoderConfig::TransformerBn {
                transformer,
                final_size,
                num_blocks,
            } => {
                if *final_size == 0 {
                    errors.push("encoder.final_size must be greater than 0".to_string());
                }
                transformer_errors(transformer, feature_size, Some(max_frames), errors);
                if *num_blocks > 1 && *final_size > 0 {
                    transformer_errors(transformer, *final_size, Some(max_frames), errors);
                }
            }
            EncoderConfig::ClusterBlock { block, .. } => {
                if block.filter_size == 0 {
                    errors.push("encoder.block.filter_size must be greater than 0".to_string());
                }
                if block.num_clusters == 0 {
                    errors.push("encoder.block.num_clusters must be greater than 0".to_string());
                }
                if block.num_units == 0 {
                    errors.push("encoder.block.num_units must be greater than 0".to_string());
                }
            }
        }
    }
}

fn transformer_errors(
    transformer: &TransformerConfig,
    feature_size: usize,
    max_frames: Option<usize>,
    errors: &mut Vec<String>,
) {
    let mut attention = transformer.attention(feature_size);
    if let Some(max_frames) = max_frames {
        attention = attention.with_batch_norm(max_frames);
    }
    if let Err(err) = attention.validate() {
        errors.push(format!("encoder.transformer: {err}"));
    }
    if transformer.filter_size == 0 {
        errors.push("encoder.transformer.filter_size must be greater than 0".to_string());
    }
    if !(0.0..1.0).contains(&transformer.relu_dropout) {
        errors.push("encoder.transformer.relu_dropout must be in [0, 1)".to_string());
    }
}

/// Full description of a video classifier:
/// frames -> encoder? -> pooling -> gate? -> head -> prediction gate?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub feature_size: usize,
    pub max_frames: usize,
    pub num_classes: usize,
    #[serde(default)]
    pub encoder: Option<EncoderConfig>,
    pub pooling: PoolingConfig,
    /// Gate over the pooled vector.
    #[serde(default)]
    pub gate: Option<GateConfig>,
    #[serde(default)]
    pub head: HeadConfig,
    /// Gate over the head's class probabilities.
    #[serde(default)]
    pub prediction_gate: Option<GateConfig>,
    #[serde(default)]
    pub norm: NormSettings,
}

impl ModelConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: ModelConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => return Err(ModelError::ConfigFormat(other.to_string())),
        };
        config.validate()?;
        log::info!("loaded model config from {}", path.display());
        Ok(config)
    }

    /// Channel width entering pooling.
    pub fn encoded_dim(&self) -> usize {
        self.encoder
            .as_ref()
            .map_or(self.feature_size, |encoder| encoder.output_dim(self.feature_size))
    }

    /// Width of the pooled vector fed to the gate and head.
    pub fn pooled_dim(&self) -> usize {
        self.pooling.output_dim(self.encoded_dim())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.feature_size == 0 {
            errors.push("feature_size must be greater than 0".to_string());
        }
        if self.max_frames == 0 {
            errors.push("max_frames must be greater than 0".to_string());
        }
        if self.num_classes == 0 {
            errors.push("num_classes must be greater than 0".to_string());
        }

        if let Some(encoder) = &self.encoder {
            encoder.collect_errors(self.feature_size, self.max_frames, &mut errors);
        }

        if let Err(err) = self.pooling.validate() {
            errors.push(format!("pooling: {err}"));
        }
        for (name, gate) in [("gate", &self.gate), ("prediction_gate", &self.prediction_gate)] {
            if let Some(Err(err)) = gate.as_ref().map(GateConfig::validate) {
                errors.push(format!("{name}: {err}"));
            }
        }
        if let Err(err) = self.norm.validate() {
            errors.push(format!("norm: {err}"));
        }

        match &self.head {
            HeadConfig::Moe(moe) => {
                if moe.num_mixtures == 0 {
                    errors.push("head.num_mixtures must be greater than 0".to_string());
                }
                if moe.low_rank_gating == Some(0) {
                    errors.push("head.low_rank_gating must be greater than 0".to_string());
                }
                if moe.l2_penalty < 0.0 {
                    errors.push("head.l2_penalty must be >= 0".to_string());
                }
            }
            HeadConfig::FourLayerBatch => {}
            HeadConfig::ClassLearning(class) => {
                if class.layers < 2 {
                    errors.push("head.layers must be at least 2".to_string());
                }
                if let Some(keep) = class.dropout_keep {
                    if !(keep > 0.0 && keep <= 1.0) {
                        errors.push("head.dropout_keep must be in (0, 1]".to_string());
                    }
                }
                if class.l2_penalty < 0.0 {
                    errors.push("head.l2_penalty must be >= 0".to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Validation(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pooling::PoolingMethod;

    fn base() -> ModelConfig {
        ModelConfig {
            feature_size: 8,
            max_frames: 6,
            num_classes: 4,
            encoder: None,
            pooling: PoolingConfig::new(PoolingMethod::MaxMean),
            gate: None,
            head: HeadConfig::default(),
            prediction_gate: None,
            norm: NormSettings::default(),
        }
    }

    #[test]
    fn pooled_dim_follows_encoder_and_pooling() {
        let mut config = base();
        assert_eq!(config.pooled_dim(), 16);
        config.encoder = Some(EncoderConfig::TransformerBn {
            transformer: TransformerConfig {
                hidden_size: 8,
                num_heads: 2,
                filter_size: 16,
                attention_dropout: 0.0,
                relu_dropout: 0.0,
            },
            final_size: 5,
            num_blocks: 1,
        });
        assert_eq!(config.encoded_dim(), 5);
        assert_eq!(config.pooled_dim(), 10);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = base();
        config.num_classes = 0;
        config.encoder = Some(EncoderConfig::Transformer {
            transformer: TransformerConfig {
                hidden_size: 9,
                num_heads: 2,
                filter_size: 0,
                attention_dropout: 0.0,
                relu_dropout: 0.0,
            },
            num_blocks: 0,
        });
        match config.validate() {
            Err(ModelError::Validation(errors)) => {
                assert_eq!(errors.len(), 4, "{errors:?}");
                assert!(errors.iter().any(|e| e.contains("num_heads")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn parses_toml_with_defaults() {
        let config: ModelConfig = toml::from_str(
            r#"
            feature_size = 8
            max_frames = 6
            num_classes = 4

            [pooling]
            method = "mean"

            [encoder]
            kind = "cluster_block"
            num_blocks = 2

            [encoder.block]
            filter_size = 16
            num_clusters = 3
            num_units = 4

            [prediction_gate]
            kind = "correlation"
            order = "positive_only"
            "#,
        )
        .unwrap();
        assert_eq!(config.encoder.as_ref().map(EncoderConfig::num_blocks), Some(2));
        assert_eq!(config.head, HeadConfig::default());
        assert!(config.gate.is_none());
        assert!(config.validate().is_ok());
    }
}
