//! Classifier heads mapping a pooled `(batch, input_dim)` vector to per-class
//! probabilities `(batch, num_classes)`.

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;
use layers::{
    activations::ActivationKind,
    checks,
    linear::{squared_norm, Dense, DenseConfig},
    norm::{BatchNorm, LayerNorm, NormSettings},
    residual::Dropout,
    Layer, LayerError,
};
use serde::{Deserialize, Serialize};

/// A [`Layer`] producing class probabilities, with an L2 penalty over its
/// regularised weights.
pub trait Classifier: Layer {
    fn input_dim(&self) -> usize;
    fn num_classes(&self) -> usize;
    /// `l2_penalty · Σ w² / 2` over the regularised weights; a scalar.
    fn regularization_loss(&self) -> Result<Tensor>;
}

/// Default L2 penalty for mixture and class-learning heads.
pub const DEFAULT_L2_PENALTY: f64 = 1e-8;

fn l2_loss(weights: &[&Tensor], l2_penalty: f64) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for weight in weights {
        let sq = squared_norm(weight)?.to_dtype(DType::F32)?;
        total = Some(match total {
            Some(acc) => acc.add(&sq)?,
            None => sq,
        });
    }
    match total {
        Some(total) => total.affine(l2_penalty * 0.5, 0.0),
        None => Err(candle_core::Error::Msg("l2_loss: no weights supplied".into())),
    }
}

/// Post-processing applied to the mixture's probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Refinement {
    #[default]
    None,
    /// Three bias-free dense layers (ReLU + batch norm on the first two) added
    /// back to the probabilities, then ReLU, batch norm and a sigmoid dense layer.
    Residual3,
    /// A `2C`-wide filter with batch norm and dropout, projected back to `C`
    /// and added to the probabilities, then ReLU, batch norm and a sigmoid dense layer.
    Filter2,
}

/// Keep probability of the dropout inside [`Refinement::Filter2`].
pub const FILTER_KEEP_PROB: f32 = 0.8;

#[derive(Debug, Clone)]
enum RefinementLayers {
    None,
    Residual3 {
        hidden: [(Dense, BatchNorm); 2],
        residual: Dense,
        norm: BatchNorm,
        output: Dense,
    },
    Filter2 {
        filter: Dense,
        filter_norm: BatchNorm,
        dropout: Dropout,
        residual: Dense,
        norm: BatchNorm,
        output: Dense,
    },
}

impl RefinementLayers {
    fn new(
        kind: Refinement,
        classes: usize,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        let output = |vb: VarBuilder| {
            Dense::new(
                DenseConfig::new(classes, classes).with_activation(ActivationKind::Sigmoid),
                vb,
            )
        };
        Ok(match kind {
            Refinement::None => RefinementLayers::None,
            Refinement::Residual3 => {
                let hidden = |name: &str| -> layers::Result<(Dense, BatchNorm)> {
                    Ok((
                        Dense::new(
                            DenseConfig::new(classes, classes)
                                .without_bias()
                                .with_activation(ActivationKind::Relu),
                            vb.pp(name),
                        )?,
                        BatchNorm::new(classes, norm, vb.pp(format!("{name}_bn")))?,
                    ))
                };
                RefinementLayers::Residual3 {
                    hidden: [hidden("weight1")?, hidden("weight2")?],
                    residual: Dense::new(DenseConfig::new(classes, classes).without_bias(), vb.pp("weight3"))?,
                    norm: BatchNorm::new(classes, norm, vb.pp("output_bn"))?,
                    output: output(vb.pp("output"))?,
                }
            }
            Refinement::Filter2 => RefinementLayers::Filter2 {
                filter: Dense::new(
                    DenseConfig::new(classes, classes * 2).with_activation(ActivationKind::Relu),
                    vb.pp("filter1"),
                )?,
                filter_norm: BatchNorm::new(classes * 2, norm, vb.pp("filter1_bn"))?,
                dropout: Dropout::from_keep_prob(FILTER_KEEP_PROB)?,
                residual: Dense::new(
                    DenseConfig::new(classes * 2, classes).without_bias(),
                    vb.pp("filter2"),
                )?,
                norm: BatchNorm::new(classes, norm, vb.pp("output_bn"))?,
                output: output(vb.pp("output"))?,
            },
        })
    }

    fn forward_t(&self, probabilities: &Tensor, train: bool) -> Result<Tensor> {
        let (correction, norm, output) = match self {
            RefinementLayers::None => return Ok(probabilities.clone()),
            RefinementLayers::Residual3 {
                hidden,
                residual,
                norm,
                output,
            } => {
                let mut x = probabilities.clone();
                for (dense, bn) in hidden {
                    x = bn.forward_t(&dense.forward(&x)?, train)?;
                }
                (residual.forward(&x)?, norm, output)
            }
            RefinementLayers::Filter2 {
                filter,
                filter_norm,
                dropout,
                residual,
                norm,
                output,
            } => {
                let x = filter_norm.forward_t(&filter.forward(probabilities)?, train)?;
                let x = dropout.forward_t(&x, train)?;
                (residual.forward(&x)?, norm, output)
            }
        };
        let refined = norm.forward_t(&probabilities.add(&correction)?.relu()?, train)?;
        output.forward(&refined)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoeConfig {
    /// Experts per class, excluding the dummy expert that always predicts 0.
    #[serde(default = "default_num_mixtures")]
    pub num_mixtures: usize,
    /// Factorises the gate projection through this many units when set.
    #[serde(default)]
    pub low_rank_gating: Option<usize>,
    #[serde(default)]
    pub refinement: Refinement,
    #[serde(default = "default_l2_penalty")]
    pub l2_penalty: f64,
}

fn default_num_mixtures() -> usize {
    2
}

fn default_l2_penalty() -> f64 {
    DEFAULT_L2_PENALTY
}

impl Default for MoeConfig {
    fn default() -> Self {
        Self {
            num_mixtures: default_num_mixtures(),
            low_rank_gating: None,
            refinement: Refinement::None,
            l2_penalty: DEFAULT_L2_PENALTY,
        }
    }
}

/// Per-class softmax over `num_mixtures` logistic experts plus a dummy expert.
#[derive(Debug, Clone)]
pub struct MixtureOfExperts {
    id: String,
    input_dim: usize,
    num_classes: usize,
    config: MoeConfig,
    gates: Vec<Dense>,
    experts: Dense,
    refinement: RefinementLayers,
}

impl MixtureOfExperts {
    pub fn new(
        input_dim: usize,
        num_classes: usize,
        config: MoeConfig,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        checks::expect_positive("moe.num_mixtures", config.num_mixtures)?;
        checks::expect_positive("moe.num_classes", num_classes)?;
        let gate_width = num_classes * (config.num_mixtures + 1);
        let gates = match config.low_rank_gating {
            None => vec![Dense::new(
                DenseConfig::new(input_dim, gate_width).without_bias(),
                vb.pp("gates"),
            )?],
            Some(rank) => {
                checks::expect_positive("moe.low_rank_gating", rank)?;
                vec![
                    Dense::new(DenseConfig::new(input_dim, rank).without_bias(), vb.pp("gates1"))?,
                    Dense::new(DenseConfig::new(rank, gate_width).without_bias(), vb.pp("gates2"))?,
                ]
            }
        };
        let experts = Dense::new(
            DenseConfig::new(input_dim, num_classes * config.num_mixtures),
            vb.pp("experts"),
        )?;
        let refinement = RefinementLayers::new(config.refinement, num_classes, norm, vb.pp("refine"))?;
        let id = layers::scope_id(&vb, "moe");
        log::debug!(
            "moe {id}: {input_dim} -> {num_classes} classes, {} mixtures, low_rank={:?}, refinement={:?}",
            config.num_mixtures,
            config.low_rank_gating,
            config.refinement
        );
        Ok(Self {
            id,
            input_dim,
            num_classes,
            config,
            gates,
            experts,
            refinement,
        })
    }

    /// Softmax over `num_mixtures + 1` gates, shaped `(batch * classes, num_mixtures + 1)`.
    pub fn gating_distribution(&self, input: &Tensor) -> Result<Tensor> {
        checks::expect_batch_vector("moe.input", input, self.input_dim)?;
        let logits = self
            .gates
            .iter()
            .try_fold(input.clone(), |x, dense| dense.forward(&x))?;
        let logits = logits.reshape(((), self.config.num_mixtures + 1))?;
        candle_nn::ops::softmax_last_dim(&logits)
    }

    /// Mixture probabilities before any refinement, `(batch, classes)`.
    pub fn mixture_probabilities(&self, input: &Tensor) -> Result<Tensor> {
        let mixtures = self.config.num_mixtures;
        let gating = self.gating_distribution(input)?;
        let experts = self
            .experts
            .forward(input)?
            .reshape(((), mixtures))?;
        let experts = candle_nn::ops::sigmoid(&experts)?;
        gating
            .narrow(1, 0, mixtures)?
            .mul(&experts)?
            .sum(1)?
            .reshape(((), self.num_classes))
    }
}

impl Layer for MixtureOfExperts {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let probabilities = self.mixture_probabilities(input)?;
        self.refinement.forward_t(&probabilities, train)
    }
}

impl Classifier for MixtureOfExperts {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn regularization_loss(&self) -> Result<Tensor> {
        let mut weights: Vec<&Tensor> = self.gates.iter().map(|dense| dense.weight()).collect();
        weights.push(self.experts.weight());
        l2_loss(&weights, self.config.l2_penalty)
    }
}

/// Three ReLU + batch-norm layers of width `num_classes`, then a sigmoid
/// layer whose bias starts at 0.01.
#[derive(Debug, Clone)]
pub struct FourLayerBatchNet {
    id: String,
    input_dim: usize,
    hidden: Vec<(Dense, BatchNorm)>,
    output: Dense,
}

impl FourLayerBatchNet {
    pub fn new(
        input_dim: usize,
        num_classes: usize,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        let hidden = (1..=3)
            .map(|i| {
                let fan_in = if i == 1 { input_dim } else { num_classes };
                Ok((
                    Dense::new(
                        DenseConfig::new(fan_in, num_classes)
                            .without_bias()
                            .with_activation(ActivationKind::Relu),
                        vb.pp(format!("fc{i}")),
                    )?,
                    BatchNorm::new(num_classes, norm, vb.pp(format!("fc{i}_bn")))?,
                ))
            })
            .collect::<layers::Result<Vec<_>>>()?;
        let output = Dense::new(
            DenseConfig::new(num_classes, num_classes)
                .with_bias(0.01)
                .with_activation(ActivationKind::Sigmoid),
            vb.pp("fc4"),
        )?;
        Ok(Self {
            id: layers::scope_id(&vb, "four_layer_batch"),
            input_dim,
            hidden,
            output,
        })
    }
}

impl Layer for FourLayerBatchNet {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_batch_vector("four_layer_batch.input", input, self.input_dim)?;
        let hidden = self
            .hidden
            .iter()
            .try_fold(input.clone(), |x, (dense, bn)| bn.forward_t(&dense.forward(&x)?, train))?;
        self.output.forward(&hidden)
    }
}

impl Classifier for FourLayerBatchNet {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn num_classes(&self) -> usize {
        self.output.config().output_dim
    }

    /// This head carries no weight penalty.
    fn regularization_loss(&self) -> Result<Tensor> {
        Tensor::zeros((), DType::F32, self.output.weight().device())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassLearningConfig {
    /// Dense layers including the sigmoid output layer.
    #[serde(default = "default_class_learning_layers")]
    pub layers: usize,
    /// Keep probability of dropout after each hidden layer; defaults to 0.5
    /// for the three-layer net and none otherwise.
    #[serde(default)]
    pub dropout_keep: Option<f32>,
    #[serde(default = "default_l2_penalty")]
    pub l2_penalty: f64,
}

fn default_class_learning_layers() -> usize {
    3
}

impl ClassLearningConfig {
    pub fn three_layer() -> Self {
        Self {
            layers: 3,
            dropout_keep: None,
            l2_penalty: DEFAULT_L2_PENALTY,
        }
    }

    pub fn four_layer() -> Self {
        Self {
            layers: 4,
            ..Self::three_layer()
        }
    }

    pub fn resolved_dropout_keep(&self) -> Option<f32> {
        self.dropout_keep
            .or(if self.layers == 3 { Some(0.5) } else { None })
    }
}

/// Bias-free dense layers with layer norm and leaky ReLU, then a sigmoid layer
/// whose bias starts at 0.1. Every layer is `num_classes` wide.
#[derive(Debug, Clone)]
pub struct ClassLearningNet {
    id: String,
    input_dim: usize,
    l2_penalty: f64,
    hidden: Vec<(Dense, LayerNorm)>,
    dropout: Option<Dropout>,
    output: Dense,
}

impl ClassLearningNet {
    pub fn new(
        input_dim: usize,
        num_classes: usize,
        config: &ClassLearningConfig,
        norm: &NormSettings,
        vb: VarBuilder,
    ) -> layers::Result<Self> {
        if config.layers < 2 {
            return Err(LayerError::invalid(
                "class_learning.layers",
                format!("needs at least 2 layers, got {}", config.layers),
            ));
        }
        let hidden = (1..config.layers)
            .map(|i| {
                let fan_in = if i == 1 { input_dim } else { num_classes };
                Ok((
                    Dense::new(
                        DenseConfig::new(fan_in, num_classes).without_bias(),
                        vb.pp(format!("fc{i}")),
                    )?,
                    LayerNorm::new(num_classes, norm, vb.pp(format!("fc{i}_norm")))?,
                ))
            })
            .collect::<layers::Result<Vec<_>>>()?;
        let dropout = config
            .resolved_dropout_keep()
            .map(Dropout::from_keep_prob)
            .transpose()?;
        let output = Dense::new(
            DenseConfig::new(num_classes, num_classes)
                .with_bias(0.1)
                .with_activation(ActivationKind::Sigmoid),
            vb.pp(format!("fc{}", config.layers)),
        )?;
        Ok(Self {
            id: layers::scope_id(&vb, "class_learning"),
            input_dim,
            l2_penalty: config.l2_penalty,
            hidden,
            dropout,
            output,
        })
    }
}

impl Layer for ClassLearningNet {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_batch_vector("class_learning.input", input, self.input_dim)?;
        let leaky = ActivationKind::leaky_relu();
        let mut x = input.clone();
        for (dense, norm) in &self.hidden {
            x = leaky.apply(&norm.forward(&dense.forward(&x)?)?)?;
            if let Some(dropout) = &self.dropout {
                x = dropout.forward_t(&x, train)?;
            }
        }
        self.output.forward(&x)
    }
}

impl Classifier for ClassLearningNet {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn num_classes(&self) -> usize {
        self.output.config().output_dim
    }

    fn regularization_loss(&self) -> Result<Tensor> {
        let mut weights: Vec<&Tensor> = self.hidden.iter().map(|(dense, _)| dense.weight()).collect();
        weights.push(self.output.weight());
        l2_loss(&weights, self.l2_penalty)
    }
}

/// Serializable description of a classifier head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HeadConfig {
    Moe(MoeConfig),
    FourLayerBatch,
    ClassLearning(ClassLearningConfig),
}

impl Default for HeadConfig {
    fn default() -> Self {
        HeadConfig::Moe(MoeConfig::default())
    }
}

pub fn build_head(
    config: &HeadConfig,
    input_dim: usize,
    num_classes: usize,
    norm: &NormSettings,
    vb: VarBuilder,
) -> layers::Result<Box<dyn Classifier>> {
    Ok(match config {
        HeadConfig::Moe(moe) => Box::new(MixtureOfExperts::new(input_dim, num_classes, moe.clone(), norm, vb)?),
        HeadConfig::FourLayerBatch => Box::new(FourLayerBatchNet::new(input_dim, num_classes, norm, vb)?),
        HeadConfig::ClassLearning(class) => {
            Box::new(ClassLearningNet::new(input_dim, num_classes, class, norm, vb)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn in_unit_interval(tensor: &Tensor) -> Result<bool> {
        let values = tensor.flatten_all()?.to_vec1::<f32>()?;
        Ok(values.iter().all(|v| (0.0..=1.0).contains(v)))
    }

    #[test]
    fn moe_gating_distribution_has_dummy_column() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let moe = MixtureOfExperts::new(6, 4, MoeConfig::default(), &NormSettings::default(), vb)?;
        let input = Tensor::randn(0f32, 1.0, (3, 6), &Device::Cpu)?;
        assert_eq!(moe.gating_distribution(&input)?.dims(), &[12, 3]);
        let out = moe.forward_t(&input, false)?;
        assert_eq!(out.dims(), &[3, 4]);
        assert!(in_unit_interval(&out)?);
        Ok(())
    }

    #[test]
    fn low_rank_gating_uses_two_projections() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = MoeConfig {
            low_rank_gating: Some(2),
            ..MoeConfig::default()
        };
        let moe = MixtureOfExperts::new(6, 4, config, &NormSettings::default(), vb)?;
        // gates1, gates2 and experts weight + bias
        assert_eq!(varmap.all_vars().len(), 4);
        let input = Tensor::randn(0f32, 1.0, (2, 6), &Device::Cpu)?;
        assert_eq!(moe.forward_t(&input, true)?.dims(), &[2, 4]);
        Ok(())
    }

    #[test]
    fn refinements_keep_probabilities() -> anyhow::Result<()> {
        for refinement in [Refinement::Residual3, Refinement::Filter2] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let config = MoeConfig {
                refinement,
                ..MoeConfig::default()
            };
            let moe = MixtureOfExperts::new(5, 3, config, &NormSettings::default(), vb)?;
            let input = Tensor::randn(0f32, 1.0, (4, 5), &Device::Cpu)?;
            for train in [true, false] {
                let out = moe.forward_t(&input, train)?;
                assert_eq!(out.dims(), &[4, 3], "{refinement:?}");
                assert!(in_unit_interval(&out)?);
            }
        }
        Ok(())
    }

    #[test]
    fn regularization_scales_with_penalty() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = MoeConfig {
            l2_penalty: 2.0,
            ..MoeConfig::default()
        };
        let moe = MixtureOfExperts::new(3, 2, config, &NormSettings::default(), vb)?;
        let expected = squared_norm(moe.gates[0].weight())?.to_vec0::<f32>()?
            + squared_norm(moe.experts.weight())?.to_vec0::<f32>()?;
        let loss = moe.regularization_loss()?.to_vec0::<f32>()?;
        assert!((loss - expected).abs() < 1e-4, "{loss} vs {expected}");
        Ok(())
    }

    #[test]
    fn four_layer_net_starts_bias_at_one_hundredth() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = FourLayerBatchNet::new(8, 5, &NormSettings::default(), vb.pp("head"))?;
        let input = Tensor::randn(0f32, 1.0, (6, 8), &Device::Cpu)?;
        let out = net.forward_t(&input, true)?;
        assert_eq!(out.dims(), &[6, 5]);
        assert!(in_unit_interval(&out)?);
        assert_eq!(net.regularization_loss()?.to_vec0::<f32>()?, 0.0);

        let bias = varmap
            .data()
            .lock()
            .unwrap()
            .get("head.fc4.bias")
            .map(|var| var.as_tensor().to_vec1::<f32>())
            .transpose()?
            .unwrap();
        assert!(bias.iter().all(|b| (b - 0.01).abs() < 1e-7));
        Ok(())
    }

    #[test]
    fn class_learning_depth_and_dropout_defaults() -> anyhow::Result<()> {
        assert_eq!(ClassLearningConfig::three_layer().resolved_dropout_keep(), Some(0.5));
        assert_eq!(ClassLearningConfig::four_layer().resolved_dropout_keep(), None);

        for config in [ClassLearningConfig::three_layer(), ClassLearningConfig::four_layer()] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let net = ClassLearningNet::new(7, 4, &config, &NormSettings::default(), vb)?;
            assert_eq!(net.hidden.len(), config.layers - 1);
            let input = Tensor::randn(0f32, 1.0, (3, 7), &Device::Cpu)?;
            let out = net.forward_t(&input, true)?;
            assert_eq!(out.dims(), &[3, 4]);
            assert!(in_unit_interval(&out)?);
            assert!(net.regularization_loss()?.to_vec0::<f32>()? > 0.0);
        }
        Ok(())
    }
}
