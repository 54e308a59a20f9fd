//! Parameter-free reductions over the frame axis.

use candle_core::{Result, Tensor, D};
use layers::{checks, norm::l2_normalize_last, Layer};

fn finish(pooled: Tensor, l2_normalize: bool) -> Result<Tensor> {
    if l2_normalize {
        l2_normalize_last(&pooled)
    } else {
        Ok(pooled)
    }
}

/// Per-channel maximum across frames.
#[derive(Debug, Clone)]
pub struct MaxPooling {
    id: String,
    channels: usize,
    l2_normalize: bool,
}

impl MaxPooling {
    pub fn new(id: impl Into<String>, channels: usize, l2_normalize: bool) -> Self {
        Self {
            id: id.into(),
            channels,
            l2_normalize,
        }
    }
}

impl Layer for MaxPooling {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("max_pooling.input", input, self.channels)?;
        finish(input.max(1)?, self.l2_normalize)
    }
}

/// Per-channel average across frames.
#[derive(Debug, Clone)]
pub struct MeanPooling {
    id: String,
    channels: usize,
    l2_normalize: bool,
}

impl MeanPooling {
    pub fn new(id: impl Into<String>, channels: usize, l2_normalize: bool) -> Self {
        Self {
            id: id.into(),
            channels,
            l2_normalize,
        }
    }
}

impl Layer for MeanPooling {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("mean_pooling.input", input, self.channels)?;
        finish(input.mean(1)?, self.l2_normalize)
    }
}

/// Concatenation `[max ‖ mean]`, each half normalised on its own.
#[derive(Debug, Clone)]
pub struct MaxMeanPooling {
    id: String,
    channels: usize,
    l2_normalize: bool,
}

impl MaxMeanPooling {
    pub fn new(id: impl Into<String>, channels: usize, l2_normalize: bool) -> Self {
        Self {
            id: id.into(),
            channels,
            l2_normalize,
        }
    }
}

impl Layer for MaxMeanPooling {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("max_mean_pooling.input", input, self.channels)?;
        let max = finish(input.max(1)?, self.l2_normalize)?;
        let mean = finish(input.mean(1)?, self.l2_normalize)?;
        Tensor::cat(&[&max, &mean], D::Minus1)
    }
}
