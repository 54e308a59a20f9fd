//! Positive/negative correlation gates over class scores.
//!
//! A positive step adds a bounded boost `relu6(x · P)`; a negative step
//! subtracts a bounded penalty `relu6(-(x · N))`. Steps run in the configured
//! order, each consuming the previous step's output, and the result goes
//! through a softmax over classes.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use layers::{
    activations::ActivationKind,
    checks,
    linear::{LinearInit, Projection},
    Layer,
};
use serde::{Deserialize, Serialize};

/// Order in which correction steps are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOrder {
    PositiveNegative,
    NegativePositive,
    PositiveOnly,
}

#[derive(Debug, Clone)]
pub struct CorrelationGate {
    id: String,
    order: GateOrder,
    positive: Projection,
    negative: Option<Projection>,
}

impl CorrelationGate {
    pub fn new(num_classes: usize, order: GateOrder, vb: VarBuilder) -> layers::Result<Self> {
        let positive = Projection::new(
            num_classes,
            num_classes,
            LinearInit::ScaledNormal,
            "positive_weights",
            &vb,
        )?;
        let negative = match order {
            GateOrder::PositiveOnly => None,
            _ => Some(Projection::new(
                num_classes,
                num_classes,
                LinearInit::ScaledNormal,
                "negative_weights",
                &vb,
            )?),
        };
        Ok(Self {
            id: layers::scope_id(&vb, "correlation_gate"),
            order,
            positive,
            negative,
        })
    }

    pub fn order(&self) -> GateOrder {
        self.order
    }

    fn positive_step(&self, scores: &Tensor) -> Result<Tensor> {
        let boost = ActivationKind::Relu6.apply(&self.positive.forward(scores)?)?;
        scores.add(&boost)
    }

    fn negative_step(&self, scores: &Tensor) -> Result<Tensor> {
        match &self.negative {
            Some(negative) => {
                let penalty = ActivationKind::Relu6.apply(&negative.forward(scores)?.neg()?)?;
                scores.sub(&penalty)
            }
            None => Ok(scores.clone()),
        }
    }

    /// Scores after the correction steps, before the softmax.
    pub fn corrected_scores(&self, input: &Tensor) -> Result<Tensor> {
        checks::expect_batch_vector("correlation_gate.input", input, self.positive.input_dim())?;
        match self.order {
            GateOrder::PositiveNegative => self.negative_step(&self.positive_step(input)?),
            GateOrder::NegativePositive => self.positive_step(&self.negative_step(input)?),
            GateOrder::PositiveOnly => self.positive_step(input),
        }
    }
}

impl Layer for CorrelationGate {
    fn id(&self) -> &str {
        &self.id
    }

    fn forward_t(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
        candle_nn::ops::softmax_last_dim(&self.corrected_scores(input)?)
    }
}
