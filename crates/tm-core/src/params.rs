//! Parameter store.
//!
//! Parameters live in two disjoint groups. `OptimizedParams` is the only
//! group the optimizer ever sees. `AttentionParams` stays fixed after
//! initialisation and `MemoryBank` is mutated by every forward pass outside
//! any gradient computation.

use rand::Rng;

use crate::config::{MemoryBankPolicy, ModelConfig};
use crate::error::{ModelError, Result};
use crate::linalg::{self, Matrix};

/// Trainable projection weights, biases and the scalar forget gate.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizedParams {
    /// hiddenDim × (inputDim + memoryDim)
    pub w1: Matrix,
    pub b1: Vec<f64>,
    /// (memoryDim + inputDim) × hiddenDim
    pub w2: Matrix,
    pub b2: Vec<f64>,
    pub forget_gate: f64,
}

impl OptimizedParams {
    pub fn init(config: &ModelConfig, rng: &mut impl Rng) -> Self {
        let joint = config.joint_dim();
        Self {
            w1: Matrix::glorot(config.hidden_dim, joint, rng),
            b1: vec![0.0; config.hidden_dim],
            w2: Matrix::glorot(joint, config.hidden_dim, rng),
            b2: vec![0.0; joint],
            forget_gate: config.forget_gate_init,
        }
    }

    /// Same shapes, all zeros. Used as a gradient accumulator.
    pub fn zeros_like(&self) -> Self {
        Self {
            w1: Matrix::zeros(self.w1.rows, self.w1.cols),
            b1: vec![0.0; self.b1.len()],
            w2: Matrix::zeros(self.w2.rows, self.w2.cols),
            b2: vec![0.0; self.b2.len()],
            forget_gate: 0.0,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.forget_gate.is_finite()
            && linalg::all_finite(&self.w1.data)
            && linalg::all_finite(&self.b1)
            && linalg::all_finite(&self.w2.data)
            && linalg::all_finite(&self.b2)
    }
}

/// Per-head query/key/value projections plus the combined output projection.
#[derive(Clone, Debug, PartialEq)]
pub struct AttentionParams {
    pub query: Vec<Matrix>,
    pub key: Vec<Matrix>,
    pub value: Vec<Matrix>,
    /// memoryDim × (numHeads · memoryDim)
    pub output: Matrix,
}

impl AttentionParams {
    pub fn init(config: &ModelConfig, rng: &mut impl Rng) -> Self {
        let d = config.memory_dim;
        let h = config.num_heads;
        let query = (0..h).map(|_| Matrix::glorot(d, d, rng)).collect();
        let key = (0..h).map(|_| Matrix::glorot(d, d, rng)).collect();
        let value = (0..h).map(|_| Matrix::glorot(d, d, rng)).collect();
        let output = Matrix::glorot(d, h * d, rng);
        Self {
            query,
            key,
            value,
            output,
        }
    }

    pub fn num_heads(&self) -> usize {
        self.query.len()
    }

    pub fn is_finite(&self) -> bool {
        self.query
            .iter()
            .chain(&self.key)
            .chain(&self.value)
            .chain(std::iter::once(&self.output))
            .all(|m| linalg::all_finite(&m.data))
    }
}

/// Ordered accumulator layers updated from the attention output.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryBank {
    pub layers: Vec<Vec<f64>>,
}

impl MemoryBank {
    pub fn zeros(num_layers: usize, memory_dim: usize) -> Self {
        Self {
            layers: vec![vec![0.0; memory_dim]; num_layers],
        }
    }

    /// Fold `update` into every layer according to `policy`.
    ///
    /// All or nothing: when any resulting value would be non-finite the bank
    /// is left as it was and `false` is returned.
    pub fn absorb(&mut self, update: &[f64], policy: MemoryBankPolicy) -> bool {
        let mut next = self.layers.clone();
        for layer in &mut next {
            match policy {
                MemoryBankPolicy::Additive => {
                    for (l, u) in layer.iter_mut().zip(update) {
                        *l += u;
                    }
                }
                MemoryBankPolicy::Decay { factor } => {
                    for (l, u) in layer.iter_mut().zip(update) {
                        *l = factor * *l + u;
                    }
                }
                MemoryBankPolicy::Clamp { max_norm } => {
                    for (l, u) in layer.iter_mut().zip(update) {
                        *l += u;
                    }
                    let n = linalg::norm(layer);
                    if n > max_norm {
                        let s = max_norm / n;
                        layer.iter_mut().for_each(|l| *l *= s);
                    }
                }
            }
            if !linalg::all_finite(layer) {
                return false;
            }
        }
        self.layers = next;
        true
    }

    pub fn is_finite(&self) -> bool {
        self.layers.iter().all(|l| linalg::all_finite(l))
    }

    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.iter_mut().for_each(|l| *l = 0.0);
        }
    }
}

/// Deep snapshot of every parameter array. Never aliases live parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelWeights {
    pub optimized: OptimizedParams,
    pub attention: AttentionParams,
    pub memory_bank: MemoryBank,
}

fn check_matrix(what: &str, m: &Matrix, rows: usize, cols: usize) -> Result<()> {
    if m.shape() != [rows, cols] || m.data.len() != rows * cols {
        return Err(ModelError::shape(what, &[rows, cols], &m.shape()));
    }
    Ok(())
}

fn check_heads(what: &str, heads: &[Matrix], count: usize, d: usize) -> Result<()> {
    ModelError::check_len(what, count, heads.len())?;
    for (i, m) in heads.iter().enumerate() {
        check_matrix(&format!("{what}[{i}]"), m, d, d)?;
    }
    Ok(())
}

impl ModelWeights {
    pub fn is_finite(&self) -> bool {
        self.optimized.is_finite() && self.attention.is_finite() && self.memory_bank.is_finite()
    }

    /// Verify every array against the shapes `config` implies.
    pub fn check_shapes(&self, config: &ModelConfig) -> Result<()> {
        let joint = config.joint_dim();
        let d = config.memory_dim;
        let h = config.num_heads;
        let o = &self.optimized;

        check_matrix("W1", &o.w1, config.hidden_dim, joint)?;
        ModelError::check_len("b1", config.hidden_dim, o.b1.len())?;
        check_matrix("W2", &o.w2, joint, config.hidden_dim)?;
        ModelError::check_len("b2", joint, o.b2.len())?;

        let a = &self.attention;
        check_heads("queryWeights", &a.query, h, d)?;
        check_heads("keyWeights", &a.key, h, d)?;
        check_heads("valueWeights", &a.value, h, d)?;
        check_matrix("attentionOutputWeights", &a.output, d, h * d)?;

        let layers = &self.memory_bank.layers;
        ModelError::check_len("hierarchicalMemory", config.num_layers, layers.len())?;
        for (i, layer) in layers.iter().enumerate() {
            ModelError::check_len(&format!("hierarchicalMemory[{i}]"), d, layer.len())?;
        }
        Ok(())
    }
}
