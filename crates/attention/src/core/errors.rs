//! Error types emitted while configuring attention components.

use layers::LayerError;
use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// A configuration value is outside its valid range.
    #[error("invalid attention config `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
    /// Failure while creating a sub-layer or its parameters.
    #[error(transparent)]
    Layer(#[from] LayerError),
}

impl AttentionError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        Self::Layer(LayerError::Candle(err))
    }
}

impl From<AttentionError> for LayerError {
    fn from(err: AttentionError) -> Self {
        match err {
            AttentionError::InvalidConfig { field, reason } => LayerError::InvalidHyperparameter {
                name: field,
                reason,
            },
            AttentionError::Layer(inner) => inner,
        }
    }
}
