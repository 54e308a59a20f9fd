//! Self-attention and attention-cluster pooling over frame sequences.
//!
//! All components consume `(batch, frames, feature_size)` tensors:
//!
//! * [`MultiHeadAttention`] splits one `hidden_size` projection into heads and
//!   returns `(batch, frames, feature_size)`. It also supports
//!   cross-attention through [`MultiHeadAttention::forward_qk`].
//! * [`PerHeadAttention`] gives every head its own projections and
//!   normalises head outputs before mixing them.
//! * [`ClusterAttention`] and [`SingleFcClusterAttention`] pool the frame
//!   axis into a fixed number of cluster slots,
//!   `(batch, num_clusters, feature_size)`.
//!
//! Dropout applies to attention weights only when `train` is set. Construction
//! failures are reported as [`AttentionError`], which converts into
//! [`layers::LayerError`].

pub mod cluster;
pub mod core;
pub mod multi_head;
pub mod per_head;

pub use cluster::{
    ClusterAttention, ClusterAttentionConfig, ClusterAttentionKind, SingleFcClusterAttention,
};
pub use core::{AttentionConfig, AttentionError, AttentionVariant, BuildResult};
pub use multi_head::MultiHeadAttention;
pub use per_head::PerHeadAttention;
