//! Frame encoders, classifier heads and the assembled video classifier.
//!
//! [`VideoClassifier`] wires an optional [`StackedEncoder`] of transformer or
//! cluster blocks, a pooling layer, an optional context gate and a classifier
//! head from a [`ModelConfig`] loaded from TOML or JSON. Every stage is built
//! under its own `VarBuilder` scope so parameters never collide.

pub mod block;
pub mod config;
pub mod encoder;
pub mod error;
pub mod feed_forward;
pub mod heads;
pub mod model;

pub use block::{ClusterBlock, ClusterBlockConfig};
pub use config::{EncoderConfig, ModelConfig};
pub use encoder::{
    SequenceBlock, StackedEncoder, TransformerConfig, TransformerDecoder, TransformerEncoder,
    TransformerEncoderBn,
};
pub use error::{ModelError, Result};
pub use feed_forward::{FeedForward, FeedForwardBn};
pub use heads::{
    build_head, ClassLearningConfig, ClassLearningNet, Classifier, FourLayerBatchNet, HeadConfig,
    MixtureOfExperts, MoeConfig, Refinement,
};
pub use model::VideoClassifier;
