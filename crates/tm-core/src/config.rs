use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{ModelError, Result};
use crate::manifold::ManifoldOptions;

/// How the hierarchical memory bank folds each attention output into its layers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MemoryBankPolicy {
    /// layer ← layer + attention. Unbounded growth over repeated calls.
    #[default]
    Additive,
    /// layer ← factor · layer + attention.
    Decay { factor: f64 },
    /// Additive, then rescaled down to `max_norm` when the layer norm exceeds it.
    Clamp {
        #[serde(rename = "maxNorm")]
        max_norm: f64,
    },
}

impl MemoryBankPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Additive => "additive",
            Self::Decay { .. } => "decay",
            Self::Clamp { .. } => "clamp",
        }
    }
}

/// Model hyperparameters. Immutable once a model has been built from it.
///
/// `memory_dim` travels as `outputDim` on the wire; `memoryDim` is accepted
/// as an alias when reading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    #[serde(rename = "outputDim", alias = "memoryDim")]
    pub memory_dim: usize,
    pub learning_rate: f64,
    pub use_manifold: bool,
    pub momentum_factor: f64,
    pub forget_gate_init: f64,
    pub max_step_size: f64,
    pub tangent_epsilon: f64,
    pub num_heads: usize,
    pub num_layers: usize,
    pub memory_bank_policy: MemoryBankPolicy,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_dim: DEFAULT_INPUT_DIM,
            hidden_dim: DEFAULT_HIDDEN_DIM,
            memory_dim: DEFAULT_MEMORY_DIM,
            learning_rate: DEFAULT_LEARNING_RATE,
            use_manifold: false,
            momentum_factor: DEFAULT_MOMENTUM_FACTOR,
            forget_gate_init: DEFAULT_FORGET_GATE_INIT,
            max_step_size: DEFAULT_MAX_STEP_SIZE,
            tangent_epsilon: DEFAULT_TANGENT_EPSILON,
            num_heads: DEFAULT_NUM_HEADS,
            num_layers: DEFAULT_NUM_LAYERS,
            memory_bank_policy: MemoryBankPolicy::Additive,
        }
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ModelError::InvalidConfig(format!(
            "{name} must be a positive finite number, got {value}"
        )))
    }
}

fn nonzero(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        Err(ModelError::InvalidConfig(format!("{name} must be at least 1")))
    } else {
        Ok(())
    }
}

impl ModelConfig {
    /// Small config convenient for tests and demos; everything else default.
    pub fn with_dims(input_dim: usize, hidden_dim: usize, memory_dim: usize) -> Self {
        Self {
            input_dim,
            hidden_dim,
            memory_dim,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        nonzero("inputDim", self.input_dim)?;
        nonzero("hiddenDim", self.hidden_dim)?;
        nonzero("outputDim", self.memory_dim)?;
        nonzero("numHeads", self.num_heads)?;
        nonzero("numLayers", self.num_layers)?;
        positive("learningRate", self.learning_rate)?;
        positive("maxStepSize", self.max_step_size)?;
        positive("tangentEpsilon", self.tangent_epsilon)?;

        if !(0.0..1.0).contains(&self.momentum_factor) {
            return Err(ModelError::InvalidConfig(format!(
                "momentumFactor must be in [0, 1), got {}",
                self.momentum_factor
            )));
        }
        if !self.forget_gate_init.is_finite() {
            return Err(ModelError::InvalidConfig(
                "forgetGateInit must be finite".to_string(),
            ));
        }

        match self.memory_bank_policy {
            MemoryBankPolicy::Additive => {}
            MemoryBankPolicy::Decay { factor } => {
                if !(0.0..=1.0).contains(&factor) {
                    return Err(ModelError::InvalidConfig(format!(
                        "decay factor must be in [0, 1], got {factor}"
                    )));
                }
            }
            MemoryBankPolicy::Clamp { max_norm } => positive("maxNorm", max_norm)?,
        }

        Ok(())
    }

    /// Length of the concatenated `[x ; gated memory]` row.
    pub fn joint_dim(&self) -> usize {
        self.input_dim + self.memory_dim
    }

    pub fn manifold_options(&self) -> ManifoldOptions {
        ManifoldOptions {
            use_manifold: self.use_manifold,
            max_step_size: self.max_step_size,
            tangent_epsilon: self.tangent_epsilon,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.joint_dim(), 128);
    }

    #[test]
    fn test_zero_dims_rejected() {
        for config in [
            ModelConfig::with_dims(0, 8, 4),
            ModelConfig::with_dims(4, 0, 4),
            ModelConfig::with_dims(4, 8, 0),
            ModelConfig {
                num_heads: 0,
                ..ModelConfig::default()
            },
            ModelConfig {
                num_layers: 0,
                ..ModelConfig::default()
            },
        ] {
            assert!(
                matches!(config.validate(), Err(ModelError::InvalidConfig(_))),
                "config should be rejected: {config:?}"
            );
        }
    }

    #[test]
    fn test_bad_rates_rejected() {
        let negative_lr = ModelConfig {
            learning_rate: -1e-3,
            ..ModelConfig::default()
        };
        assert!(negative_lr.validate().is_err());

        let nan_step = ModelConfig {
            max_step_size: f64::NAN,
            ..ModelConfig::default()
        };
        assert!(nan_step.validate().is_err());

        let bad_decay = ModelConfig {
            memory_bank_policy: MemoryBankPolicy::Decay { factor: 1.5 },
            ..ModelConfig::default()
        };
        assert!(bad_decay.validate().is_err());
    }

    #[test]
    fn test_output_dim_wire_name() {
        let config = ModelConfig::with_dims(4, 8, 6);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["outputDim"], 6);
        assert_eq!(json["inputDim"], 4);
        assert!(json.get("memoryDim").is_none());
        assert_eq!(json["memoryBankPolicy"]["kind"], "additive");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ModelConfig =
            serde_json::from_str(r#"{"inputDim": 4, "memoryDim": 4, "hiddenDim": 8}"#).unwrap();
        assert_eq!(config.input_dim, 4);
        assert_eq!(config.memory_dim, 4);
        assert_eq!(config.num_heads, DEFAULT_NUM_HEADS);
        assert_eq!(config.learning_rate, DEFAULT_LEARNING_RATE);
    }

    #[test]
    fn test_policy_parses_tagged() {
        let config: ModelConfig = serde_json::from_str(
            r#"{"memoryBankPolicy": {"kind": "clamp", "maxNorm": 2.5}}"#,
        )
        .unwrap();
        assert_eq!(
            config.memory_bank_policy,
            MemoryBankPolicy::Clamp { max_norm: 2.5 }
        );
    }
}
