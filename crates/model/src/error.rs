use attention::AttentionError;
use layers::LayerError;
use thiserror::Error;

/// Errors raised while loading configurations or assembling a classifier.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported configuration extension '{0}'")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl From<AttentionError> for ModelError {
    fn from(err: AttentionError) -> Self {
        Self::Layer(err.into())
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
