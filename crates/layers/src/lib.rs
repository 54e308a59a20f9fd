//! Building blocks shared by the pooling, gating, attention and classifier crates.
//!
//! Every component in the workspace implements [`Layer`]: a single
//! `forward_t(input, train)` contract plus an explicit identifier, the
//! `VarBuilder` prefix its parameters are stored under. Constructors validate
//! hyperparameters and report failures through [`LayerError`]; forward passes
//! return `candle_core::Result` so they compose with Candle primitives.

pub mod activations;
pub mod checks;
pub mod linear;
pub mod norm;
pub mod residual;

use candle_core::Tensor;
use thiserror::Error;

/// Errors raised while constructing or wiring layers.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A size, rate or count was outside its valid range.
    #[error("invalid hyperparameter `{name}`: {reason}")]
    InvalidHyperparameter { name: &'static str, reason: String },
    /// Two chained components disagree on a dimension.
    #[error("{context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },
    /// Failure bubbled up from the tensor framework (parameter creation etc).
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl LayerError {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidHyperparameter {
            name,
            reason: reason.into(),
        }
    }

    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LayerError>;

/// Evaluation contract shared by every pooling, gating, attention and head component.
pub trait Layer: Send + Sync {
    /// Unique identifier of the component, equal to its parameter scope.
    fn id(&self) -> &str;

    /// Evaluates the component. `train` enables dropout and batch-norm statistics updates.
    fn forward_t(&self, input: &Tensor, train: bool) -> candle_core::Result<Tensor>;
}

impl<L: Layer + ?Sized> Layer for Box<L> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        (**self).forward_t(input, train)
    }
}

/// Renders a `VarBuilder` prefix as a component id, using `root` for the empty scope.
pub fn scope_id(vb: &candle_nn::VarBuilder, root: &str) -> String {
    let prefix = vb.prefix();
    if prefix.is_empty() {
        root.to_string()
    } else {
        prefix
    }
}
