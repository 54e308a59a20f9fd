//! Multi-head self-attention with independent per-head projections.
//!
//! Each head owns query/key/value projections of width `num_units`, computes
//! `softmax(Q Kᵀ / sqrt(num_units)) V`, then a learned scale and shift. Head
//! outputs are unit-normalised over the feature axis and divided by
//! `sqrt(num_heads)` so the concatenation keeps a bounded norm. The concatenated
//! heads go through a bias-free dense layer back to `feature_size` followed by
//! layer normalisation.

use candle_core::{Result, Tensor, D};
use candle_nn::VarBuilder;
use layers::{
    checks,
    linear::{Dense, DenseConfig},
    norm::{LayerNorm, NormSettings},
    Layer,
};

use crate::core::{normalize_share, AttentionError, BuildResult, ScaleShift};

#[derive(Debug, Clone)]
struct Head {
    q: Dense,
    k: Dense,
    v: Dense,
    scale_shift: ScaleShift,
}

impl Head {
    fn new(feature_size: usize, num_units: usize, vb: VarBuilder) -> BuildResult<Self> {
        let projection = |name: &str| {
            Dense::new(DenseConfig::new(feature_size, num_units).without_bias(), vb.pp(name))
        };
        Ok(Self {
            q: projection("q")?,
            k: projection("k")?,
            v: projection("v")?,
            scale_shift: ScaleShift::new(&vb)?,
        })
    }

    fn forward(&self, input: &Tensor, num_units: usize, num_heads: usize) -> Result<Tensor> {
        let q = self.q.forward(input)?;
        let k = self.k.forward(input)?;
        let v = self.v.forward(input)?;
        let logits = q
            .matmul(&k.transpose(1, 2)?)?
            .affine(1.0 / (num_units as f64).sqrt(), 0.0)?;
        let weights = candle_nn::ops::softmax_last_dim(&logits)?;
        let mixed = self.scale_shift.forward(&weights.matmul(&v)?)?;
        normalize_share(&mixed, num_heads)
    }
}

#[derive(Debug, Clone)]
pub struct PerHeadAttention {
    id: String,
    feature_size: usize,
    num_units: usize,
    heads: Vec<Head>,
    output: Dense,
    norm: LayerNorm,
}

impl PerHeadAttention {
    pub fn new(
        feature_size: usize,
        num_heads: usize,
        num_units: usize,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> BuildResult<Self> {
        if feature_size == 0 || num_units == 0 {
            return Err(AttentionError::invalid(
                "num_units",
                format!("feature_size ({feature_size}) and num_units ({num_units}) must be positive"),
            ));
        }
        if num_heads == 0 {
            return Err(AttentionError::invalid("num_heads", "must be greater than zero"));
        }
        let heads = (0..num_heads)
            .map(|i| Head::new(feature_size, num_units, vb.pp(format!("head{i}"))))
            .collect::<BuildResult<Vec<_>>>()?;
        let output = Dense::new(
            DenseConfig::new(num_heads * num_units, feature_size).without_bias(),
            vb.pp("output"),
        )?;
        let norm = LayerNorm::new(feature_size, norm, vb.pp("output_norm"))?;

        let id = layers::scope_id(&vb, "per_head_attention");
        log::debug!("per-head attention {id}: feature_size={feature_size} heads={num_heads} units={num_units}");
        Ok(Self {
            id,
            feature_size,
            num_units,
            heads,
            output,
            norm,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }
}

impl Layer for PerHeadAttention {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("per_head_attention.input", input, self.feature_size)?;
        let heads = self
            .heads
            .iter()
            .map(|head| head.forward(input, self.num_units, self.heads.len()))
            .collect::<Result<Vec<_>>>()?;
        let concatenated = Tensor::cat(&heads, D::Minus1)?;
        self.norm.forward(&self.output.forward(&concatenated)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn preserves_frame_layout() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attention = PerHeadAttention::new(6, 3, 4, &NormSettings::default(), vb.pp("mh"))?;
        assert_eq!(attention.num_heads(), 3);
        let input = Tensor::randn(0f32, 1.0, (2, 5, 6), &Device::Cpu)?;
        assert_eq!(attention.forward_t(&input, false)?.dims(), &[2, 5, 6]);
        // per head: q, k, v, alpha, beta; then output weight and layer norm weight + bias
        assert_eq!(varmap.all_vars().len(), 3 * 5 + 1 + 2);
        Ok(())
    }

    #[test]
    fn head_outputs_have_bounded_norm() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = Head::new(4, 4, vb)?;
        let input = Tensor::randn(0f32, 1.0, (1, 3, 4), &Device::Cpu)?;
        let out = head.forward(&input, 4, 4)?;
        let norms = out.sqr()?.sum(D::Minus1)?.sqrt()?.flatten_all()?.to_vec1::<f32>()?;
        assert!(norms.iter().all(|n| (n - 0.5).abs() < 1e-5), "{norms:?}");
        Ok(())
    }

    #[test]
    fn zero_heads_are_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(PerHeadAttention::new(4, 0, 4, &NormSettings::default(), vb).is_err());
    }
}
