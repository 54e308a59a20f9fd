//! Lightweight validation helpers shared across components.
//!
//! Tensor checks return `candle_core::Result<()>` so forward paths can
//! propagate them with `?`. Hyperparameter checks return [`crate::Result`]
//! and are meant for constructors.

use candle_core::{Error, Result, Tensor};

use crate::LayerError;

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(context: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected rank {rank}, got shape {dims:?}"
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Validates the `(batch, frames, channels)` convention with a known channel count.
pub fn expect_batch_seq_hidden(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [batch, seq, actual] if *actual == hidden => {
            if *batch == 0 || *seq == 0 {
                Err(Error::Msg(format!(
                    "{context}: batch/frame dimensions must be non-zero, got {:?}",
                    tensor.dims()
                )))
            } else {
                Ok(())
            }
        }
        dims => Err(Error::Msg(format!(
            "{context}: expected (batch, frames, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Validates the `(batch, channels)` convention.
pub fn expect_batch_vector(context: &str, tensor: &Tensor, channels: usize) -> Result<()> {
    match tensor.dims() {
        [_, actual] if *actual == channels => Ok(()),
        dims => Err(Error::Msg(format!(
            "{context}: expected (batch, {channels}) layout, got {dims:?}"
        ))),
    }
}

/// Checks only the trailing dimension, accepting any leading layout.
pub fn expect_last_dim(context: &str, tensor: &Tensor, expected: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(actual) if *actual == expected => Ok(()),
        _ => Err(Error::Msg(format!(
            "{context}: expected trailing dimension {expected}, got shape {:?}",
            tensor.dims()
        ))),
    }
}

/// Rejects zero sizes and counts at construction time.
pub fn expect_positive(name: &'static str, value: usize) -> crate::Result<()> {
    if value == 0 {
        Err(LayerError::invalid(name, "must be greater than zero"))
    } else {
        Ok(())
    }
}

/// Rejects drop probabilities outside `[0, 1)`.
pub fn expect_probability(name: &'static str, value: f32) -> crate::Result<()> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(LayerError::invalid(name, format!("must be in [0, 1), got {value}")))
    }
}

/// Rejects non-finite or non-positive epsilons.
pub fn expect_epsilon(name: &'static str, value: f64) -> crate::Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(LayerError::invalid(name, format!("must be a positive finite value, got {value}")))
    }
}
