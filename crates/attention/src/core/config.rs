//! Configuration shared by the attention components.

use serde::{Deserialize, Serialize};

use super::AttentionError;

/// How raw attention logits are conditioned before the softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AttentionVariant {
    /// Queries are scaled by `head_dim^-0.5`.
    #[default]
    Standard,
    /// Logits are batch-normalised over the key axis, and the combined head
    /// output is batch-normalised before the output transform. Keys must be
    /// exactly `max_frames` long.
    BatchNorm { max_frames: usize },
}

/// Configuration for [`MultiHeadAttention`](crate::MultiHeadAttention).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Width of the input and output features.
    pub feature_size: usize,
    /// Width of the query/key/value projections, split across heads.
    pub hidden_size: usize,
    pub num_heads: usize,
    /// Probability of dropping an attention weight during training.
    #[serde(default)]
    pub dropout: f32,
    #[serde(default)]
    pub variant: AttentionVariant,
}

impl AttentionConfig {
    pub fn new(feature_size: usize, hidden_size: usize, num_heads: usize) -> Self {
        Self {
            feature_size,
            hidden_size,
            num_heads,
            dropout: 0.0,
            variant: AttentionVariant::Standard,
        }
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_batch_norm(mut self, max_frames: usize) -> Self {
        self.variant = AttentionVariant::BatchNorm { max_frames };
        self
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads.max(1)
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.feature_size == 0 {
            return Err(AttentionError::invalid("feature_size", "must be greater than zero"));
        }
        if self.hidden_size == 0 {
            return Err(AttentionError::invalid("hidden_size", "must be greater than zero"));
        }
        if self.num_heads == 0 {
            return Err(AttentionError::invalid("num_heads", "must be greater than zero"));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(AttentionError::invalid(
                "hidden_size",
                format!(
                    "{} is not divisible by num_heads {}",
                    self.hidden_size, self.num_heads
                ),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(AttentionError::invalid(
                "dropout",
                format!("must be in [0, 1), got {}", self.dropout),
            ));
        }
        if let AttentionVariant::BatchNorm { max_frames: 0 } = self.variant {
            return Err(AttentionError::invalid("max_frames", "must be greater than zero"));
        }
        Ok(())
    }
}
