//! Gates over pooled `(batch, dim)` vectors.
//!
//! Two families live here:
//!
//! * context gates ([`ContextGate`], [`MlpGate`], [`ExpandedGate`]) that
//!   reweight features by a learned sigmoid mask, and
//! * correlation gates ([`CorrelationGate`]) that refine class scores with
//!   bounded positive and negative corrections before a softmax.
//!
//! Every gate maps `(batch, dim)` to `(batch, dim)`.

pub mod context;
pub mod correlation;

use candle_nn::VarBuilder;
use layers::{checks, norm::NormSettings, Layer, Result};
use serde::{Deserialize, Serialize};

pub use context::{ContextGate, ExpandedGate, MlpGate};
pub use correlation::{CorrelationGate, GateOrder};

/// Width of the expanded space used by [`ExpandedGate`] when none is given.
pub const DEFAULT_CLUSTER_SIZE: usize = 7200;

fn default_true() -> bool {
    true
}

fn default_cluster_size() -> usize {
    DEFAULT_CLUSTER_SIZE
}

/// Serializable description of a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GateConfig {
    Context {
        #[serde(default = "default_true")]
        batch_norm: bool,
    },
    Mlp,
    Expanded {
        #[serde(default = "default_true")]
        batch_norm: bool,
        #[serde(default = "default_cluster_size")]
        cluster_size: usize,
    },
    Correlation {
        order: GateOrder,
    },
}

impl GateConfig {
    pub fn validate(&self) -> Result<()> {
        if let GateConfig::Expanded { cluster_size, .. } = self {
            checks::expect_positive("gate.cluster_size", *cluster_size)?;
        }
        Ok(())
    }
}

/// Builds the gate described by `config` over vectors of width `dim`.
pub fn build_gate(
    config: &GateConfig,
    dim: usize,
    norm: &NormSettings,
    vb: VarBuilder,
) -> Result<Box<dyn Layer>> {
    config.validate()?;
    let gate: Box<dyn Layer> = match config {
        GateConfig::Context { batch_norm } => Box::new(ContextGate::new(dim, *batch_norm, norm, vb)?),
        GateConfig::Mlp => Box::new(MlpGate::new(dim, vb)?),
        GateConfig::Expanded {
            batch_norm,
            cluster_size,
        } => Box::new(ExpandedGate::new(dim, *cluster_size, *batch_norm, norm, vb)?),
        GateConfig::Correlation { order } => Box::new(CorrelationGate::new(dim, *order, vb)?),
    };
    log::debug!("gate {}: {config:?} over {dim} features", gate.id());
    Ok(gate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expanded_gate_defaults_are_filled_in() {
        let config: GateConfig = serde_json::from_str(r#"{ "kind": "expanded" }"#).unwrap();
        assert_eq!(
            config,
            GateConfig::Expanded {
                batch_norm: true,
                cluster_size: DEFAULT_CLUSTER_SIZE,
            }
        );
    }

    #[test]
    fn correlation_order_parses() {
        let config: GateConfig =
            serde_json::from_str(r#"{ "kind": "correlation", "order": "negative_positive" }"#).unwrap();
        assert_eq!(
            config,
            GateConfig::Correlation {
                order: GateOrder::NegativePositive
            }
        );
    }

    #[test]
    fn zero_cluster_size_is_rejected() {
        let config = GateConfig::Expanded {
            batch_norm: false,
            cluster_size: 0,
        };
        assert!(config.validate().is_err());
    }
}
