//! JSON serde for the checkpoint wire format.
//!
//! Every parameter array is stored as `{ "shape": [...], "values": [...] }`
//! under its external name (`W1`, `b1`, `W2`, `b2`, `forgetGate`,
//! `queryWeights`, `keyWeights`, `valueWeights`, `attentionOutputWeights`,
//! `hierarchicalMemory`). Values are written with shortest round-trip
//! formatting, so a save → load cycle is bit-exact.

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use crate::linalg::Matrix;
use crate::model::MemoryModel;
use crate::params::{AttentionParams, MemoryBank, ModelWeights, OptimizedParams};

pub const CURRENT_VERSION: &str = "1.0";

// --- Wire format types ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WireArray {
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WireWeights {
    #[serde(rename = "W1")]
    pub w1: WireArray,
    pub b1: WireArray,
    #[serde(rename = "W2")]
    pub w2: WireArray,
    pub b2: WireArray,
    #[serde(rename = "forgetGate")]
    pub forget_gate: f64,
    #[serde(rename = "queryWeights")]
    pub query_weights: Vec<WireArray>,
    #[serde(rename = "keyWeights")]
    pub key_weights: Vec<WireArray>,
    #[serde(rename = "valueWeights")]
    pub value_weights: Vec<WireArray>,
    #[serde(rename = "attentionOutputWeights")]
    pub attention_output_weights: WireArray,
    #[serde(rename = "hierarchicalMemory")]
    pub hierarchical_memory: Vec<WireArray>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WireModel {
    pub version: String,
    pub config: ModelConfig,
    pub weights: WireWeights,
}

// --- Conversion: Domain → Wire ---

fn matrix_to_wire(m: &Matrix) -> WireArray {
    WireArray {
        shape: vec![m.rows, m.cols],
        values: m.data.clone(),
    }
}

fn vector_to_wire(v: &[f64]) -> WireArray {
    WireArray {
        shape: vec![v.len()],
        values: v.to_vec(),
    }
}

impl WireModel {
    /// Fails with `InvalidData` when any value is NaN or infinite, since JSON
    /// has no encoding for them and the record could not be read back.
    pub fn from_model(model: &MemoryModel) -> Result<Self> {
        let weights = model.weights();
        if !weights.is_finite() {
            return Err(ModelError::InvalidData(
                "model holds non-finite parameters".to_string(),
            ));
        }
        let ModelWeights {
            optimized,
            attention,
            memory_bank,
        } = weights;

        Ok(WireModel {
            version: CURRENT_VERSION.to_string(),
            config: model.config().clone(),
            weights: WireWeights {
                w1: matrix_to_wire(&optimized.w1),
                b1: vector_to_wire(&optimized.b1),
                w2: matrix_to_wire(&optimized.w2),
                b2: vector_to_wire(&optimized.b2),
                forget_gate: optimized.forget_gate,
                query_weights: attention.query.iter().map(matrix_to_wire).collect(),
                key_weights: attention.key.iter().map(matrix_to_wire).collect(),
                value_weights: attention.value.iter().map(matrix_to_wire).collect(),
                attention_output_weights: matrix_to_wire(&attention.output),
                hierarchical_memory: memory_bank
                    .layers
                    .iter()
                    .map(|l| vector_to_wire(l))
                    .collect(),
            },
        })
    }

    /// Convert to domain weights. Only checks that each array is internally
    /// consistent; shapes against a config are checked by `load_weights`.
    pub fn into_weights(self) -> Result<ModelWeights> {
        let w = self.weights;
        Ok(ModelWeights {
            optimized: OptimizedParams {
                w1: wire_to_matrix("W1", w.w1)?,
                b1: wire_to_vector("b1", w.b1)?,
                w2: wire_to_matrix("W2", w.w2)?,
                b2: wire_to_vector("b2", w.b2)?,
                forget_gate: w.forget_gate,
            },
            attention: AttentionParams {
                query: wire_to_heads("queryWeights", w.query_weights)?,
                key: wire_to_heads("keyWeights", w.key_weights)?,
                value: wire_to_heads("valueWeights", w.value_weights)?,
                output: wire_to_matrix("attentionOutputWeights", w.attention_output_weights)?,
            },
            memory_bank: MemoryBank {
                layers: w
                    .hierarchical_memory
                    .into_iter()
                    .enumerate()
                    .map(|(i, a)| wire_to_vector(&format!("hierarchicalMemory[{i}]"), a))
                    .collect::<Result<_>>()?,
            },
        })
    }
}

// --- Conversion: Wire → Domain ---

fn wire_to_matrix(what: &str, a: WireArray) -> Result<Matrix> {
    match a.shape.as_slice() {
        &[rows, cols] => {
            let len = a.values.len();
            Matrix::from_vec(rows, cols, a.values)
                .ok_or_else(|| ModelError::shape(what, &[rows, cols], &[len]))
        }
        other => Err(ModelError::InvalidData(format!(
            "{what}: expected a 2-d shape, got {other:?}"
        ))),
    }
}

fn wire_to_vector(what: &str, a: WireArray) -> Result<Vec<f64>> {
    match a.shape.as_slice() {
        &[n] => {
            ModelError::check_len(what, n, a.values.len())?;
            Ok(a.values)
        }
        other => Err(ModelError::InvalidData(format!(
            "{what}: expected a 1-d shape, got {other:?}"
        ))),
    }
}

fn wire_to_heads(what: &str, heads: Vec<WireArray>) -> Result<Vec<Matrix>> {
    heads
        .into_iter()
        .enumerate()
        .map(|(i, a)| wire_to_matrix(&format!("{what}[{i}]"), a))
        .collect()
}

/// The dimensions that fix parameter shapes, in a comparable form.
fn shape_signature(config: &ModelConfig) -> [usize; 5] {
    [
        config.input_dim,
        config.hidden_dim,
        config.memory_dim,
        config.num_heads,
        config.num_layers,
    ]
}

/// Serialize a model's config and every parameter array to pretty JSON.
pub fn export_json(model: &MemoryModel) -> Result<String> {
    Ok(serde_json::to_string_pretty(&WireModel::from_model(model)?)?)
}

/// Load parameters from JSON into an existing model.
///
/// The record's dimensions must agree with the model's config; otherwise
/// nothing is changed and `ShapeMismatch` is returned. Hyperparameters such
/// as the learning rate stay as configured on `model`.
pub fn import_json(model: &mut MemoryModel, json: &str) -> Result<()> {
    let wire: WireModel = serde_json::from_str(json)?;
    let expected = shape_signature(model.config());
    let actual = shape_signature(&wire.config);
    if expected != actual {
        return Err(ModelError::shape("config", &expected, &actual));
    }
    model.load_weights(wire.into_weights()?)
}

/// Build a fresh model from a record, using the record's own config.
pub fn restore_json(json: &str) -> Result<MemoryModel> {
    let wire: WireModel = serde_json::from_str(json)?;
    // Every parameter is overwritten, so the init seed is irrelevant.
    let mut rng = SmallRng::seed_from_u64(0);
    let mut model = MemoryModel::new(wire.config.clone(), &mut rng)?;
    model.load_weights(wire.into_weights()?)?;
    Ok(model)
}

pub fn export_bytes(model: &MemoryModel) -> Result<Vec<u8>> {
    export_json(model).map(String::into_bytes)
}

pub fn import_bytes(model: &mut MemoryModel, bytes: &[u8]) -> Result<()> {
    let json = std::str::from_utf8(bytes)
        .map_err(|e| ModelError::InvalidData(format!("checkpoint is not UTF-8: {e}")))?;
    import_json(model, json)
}
