//! The memory model: gated MLP predictor, surprise scoring, multi-head
//! attention into the hierarchical bank, and an Adam train step over a
//! hand-derived backward pass.
//!
//! Forward (per call):
//!   gated     = memory ⊙ (1 − forget_gate)
//!   row       = [x ; gated]
//!   z         = W1 · row + b1,  h = relu(z)
//!   out       = W2 · h + b2
//!   new_mem   = out[..D],  predicted = out[D..]
//!   surprise  = mean((predicted − x)²)
//!   attn      = MHA(query = new_mem, key = value = memory)
//!   bank[i]   ← policy(bank[i], attn)       for every layer
//!
//! Train loss: mean((predicted − x_next)²) + 0.01 · surprise.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::attention::multi_head_attention;
use crate::config::ModelConfig;
use crate::constants::SURPRISE_PENALTY;
use crate::error::{ModelError, Result};
use crate::linalg;
use crate::manifold;
use crate::optimizer::{Adam, AdamConfig};
use crate::params::{AttentionParams, MemoryBank, ModelWeights, OptimizedParams};

/// Result of a single forward call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardOutput {
    pub predicted: Vec<f64>,
    /// Pre-attention memory split. The attention result only feeds the bank.
    pub new_memory: Vec<f64>,
    pub surprise: f64,
}

/// A train step's cost together with the forward pass it was computed from.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainOutput {
    pub cost: f64,
    pub forward: ForwardOutput,
}

/// Per-step costs and surprises from `train_sequence`, plus the memory
/// threaded through it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceReport {
    pub costs: Vec<f64>,
    pub surprises: Vec<f64>,
    pub memory: Vec<f64>,
}

impl SequenceReport {
    pub fn mean_cost(&self) -> f64 {
        linalg::mean(&self.costs)
    }
}

/// Intermediates of the forward pass needed by the backward pass.
struct ForwardCache {
    row: Vec<f64>,
    pre_activation: Vec<f64>,
    hidden: Vec<f64>,
}

pub struct MemoryModel {
    config: ModelConfig,
    optimized: OptimizedParams,
    attention: AttentionParams,
    bank: MemoryBank,
    optimizer: Adam,
}

impl MemoryModel {
    /// Validate `config` and initialise every parameter from `rng`.
    pub fn new(config: ModelConfig, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        let optimized = OptimizedParams::init(&config, rng);
        let attention = AttentionParams::init(&config, rng);
        let bank = MemoryBank::zeros(config.num_layers, config.memory_dim);
        let optimizer = Adam::new(&optimized, AdamConfig::default());
        Ok(Self {
            config,
            optimized,
            attention,
            bank,
            optimizer,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Number of optimizer updates applied since construction or the last load.
    pub fn step_count(&self) -> u64 {
        self.optimizer.step_count()
    }

    pub fn memory_bank(&self) -> &[Vec<f64>] {
        &self.bank.layers
    }

    pub fn reset_memory_bank(&mut self) {
        self.bank.reset();
    }

    /// Zero-filled memory vector of the configured length.
    pub fn zero_memory(&self) -> Vec<f64> {
        vec![0.0; self.config.memory_dim]
    }

    fn check_inputs(&self, x: &[f64], memory: &[f64]) -> Result<()> {
        ModelError::check_len("input", self.config.input_dim, x.len())?;
        ModelError::check_len("memory", self.config.memory_dim, memory.len())
    }

    fn forward_cached(&mut self, x: &[f64], memory: &[f64]) -> (ForwardOutput, ForwardCache) {
        let p = &self.optimized;
        let d = self.config.memory_dim;

        let keep = 1.0 - p.forget_gate;
        let mut row = Vec::with_capacity(self.config.joint_dim());
        row.extend_from_slice(x);
        row.extend(memory.iter().map(|m| m * keep));

        let pre_activation = linalg::add(&p.w1.matvec(&row), &p.b1);
        let hidden = linalg::relu(&pre_activation);
        let mut out = linalg::add(&p.w2.matvec(&hidden), &p.b2);

        let predicted = out.split_off(d);
        let new_memory = out;
        let surprise = linalg::mean_squared_error(&predicted, x);

        // A non-finite read-out (e.g. from overflowing inputs) leaves the bank as it was.
        let attended = multi_head_attention(&self.attention, &new_memory, &[memory], &[memory]);
        self.bank.absorb(&attended, self.config.memory_bank_policy);

        (
            ForwardOutput {
                predicted,
                new_memory,
                surprise,
            },
            ForwardCache {
                row,
                pre_activation,
                hidden,
            },
        )
    }

    /// Predict the next input and the next memory state.
    ///
    /// Does not touch `x` or `memory`, but always folds the attention output
    /// into the hierarchical memory bank.
    pub fn forward(&mut self, x: &[f64], memory: &[f64]) -> Result<ForwardOutput> {
        self.check_inputs(x, memory)?;
        Ok(self.forward_cached(x, memory).0)
    }

    /// Gradients of the train loss w.r.t. the optimized group.
    fn backward(
        &self,
        cache: &ForwardCache,
        x_t: &[f64],
        x_next: &[f64],
        memory: &[f64],
        predicted: &[f64],
    ) -> OptimizedParams {
        let p = &self.optimized;
        let n = self.config.input_dim;
        let d = self.config.memory_dim;
        let mut grads = p.zeros_like();

        // dL/d out: zero over the memory split, MSE terms over the prediction split.
        let mut d_out = vec![0.0; d + n];
        let k = 2.0 / n as f64;
        for j in 0..n {
            let pj = predicted[j];
            d_out[d + j] = k * (pj - x_next[j]) + SURPRISE_PENALTY * k * (pj - x_t[j]);
        }

        grads.w2.add_outer(&d_out, &cache.hidden);
        let d_hidden = p.w2.vecmat(&d_out);
        grads.b2 = d_out;

        let d_pre: Vec<f64> = d_hidden
            .iter()
            .zip(&cache.pre_activation)
            .map(|(g, z)| if *z > 0.0 { *g } else { 0.0 })
            .collect();

        grads.w1.add_outer(&d_pre, &cache.row);
        let d_row = p.w1.vecmat(&d_pre);
        grads.b1 = d_pre;

        // row[n + i] = memory[i] · (1 − forget_gate)
        grads.forget_gate = -linalg::dot(&d_row[n..], memory);

        grads
    }

    /// One Adam update toward predicting `x_next` from `x_t` and `memory`.
    ///
    /// Returns the cost together with the forward output it was computed
    /// from (pre-update parameters). A non-finite cost or gradient leaves
    /// parameters untouched and is reported as 0.
    pub fn train_step_with_output(
        &mut self,
        x_t: &[f64],
        x_next: &[f64],
        memory: &[f64],
    ) -> Result<TrainOutput> {
        self.check_inputs(x_t, memory)?;
        ModelError::check_len("next input", self.config.input_dim, x_next.len())?;

        let (forward, cache) = self.forward_cached(x_t, memory);
        let cost = linalg::mean_squared_error(&forward.predicted, x_next)
            + SURPRISE_PENALTY * forward.surprise;

        if !cost.is_finite() {
            return Ok(TrainOutput { cost: 0.0, forward });
        }

        let grads = self.backward(&cache, x_t, x_next, memory, &forward.predicted);
        if !grads.is_finite() {
            return Ok(TrainOutput { cost: 0.0, forward });
        }
        let lr = self.config.learning_rate;
        self.optimizer.step(&mut self.optimized, &grads, lr);

        Ok(TrainOutput { cost, forward })
    }

    /// One Adam update; returns the loss computed before the update.
    pub fn train_step(&mut self, x_t: &[f64], x_next: &[f64], memory: &[f64]) -> Result<f64> {
        self.train_step_with_output(x_t, x_next, memory)
            .map(|out| out.cost)
    }

    /// Train over consecutive pairs of `sequence`, threading memory through
    /// each step's `new_memory`. Fewer than two vectors is a no-op.
    pub fn train_sequence(
        &mut self,
        sequence: &[Vec<f64>],
        memory: &[f64],
    ) -> Result<SequenceReport> {
        ModelError::check_len("memory", self.config.memory_dim, memory.len())?;
        for (i, v) in sequence.iter().enumerate() {
            ModelError::check_len(&format!("sequence[{i}]"), self.config.input_dim, v.len())?;
        }

        let mut memory = memory.to_vec();
        let steps = sequence.len().saturating_sub(1);
        let mut costs = Vec::with_capacity(steps);
        let mut surprises = Vec::with_capacity(steps);
        for pair in sequence.windows(2) {
            let out = self.train_step_with_output(&pair[0], &pair[1], &memory)?;
            costs.push(out.cost);
            surprises.push(out.forward.surprise);
            memory = out.forward.new_memory;
        }

        Ok(SequenceReport {
            costs,
            surprises,
            memory,
        })
    }

    /// Move `base` by `velocity` using this model's manifold settings.
    pub fn manifold_step(&self, base: &[f64], velocity: &[f64]) -> Result<Vec<f64>> {
        manifold::manifold_step(base, velocity, &self.config.manifold_options())
    }

    /// Deep copy of every parameter array.
    pub fn weights(&self) -> ModelWeights {
        ModelWeights {
            optimized: self.optimized.clone(),
            attention: self.attention.clone(),
            memory_bank: self.bank.clone(),
        }
    }

    /// Replace every parameter array. Shapes must match this model's config;
    /// optimizer moments restart from zero.
    pub fn load_weights(&mut self, weights: ModelWeights) -> Result<()> {
        weights.check_shapes(&self.config)?;
        let ModelWeights {
            optimized,
            attention,
            memory_bank,
        } = weights;
        self.optimized = optimized;
        self.attention = attention;
        self.bank = memory_bank;
        self.optimizer.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn small_model() -> MemoryModel {
        MemoryModel::new(ModelConfig::with_dims(4, 8, 4), &mut rng()).unwrap()
    }

    fn loss(model: &mut MemoryModel, x: &[f64], xn: &[f64], m: &[f64]) -> f64 {
        let out = model.forward(x, m).unwrap();
        linalg::mean_squared_error(&out.predicted, xn) + SURPRISE_PENALTY * out.surprise
    }

    #[test]
    fn test_forward_shapes() {
        let mut model = small_model();
        let out = model.forward(&[1.0, 0.0, 0.0, 0.0], &[0.0; 4]).unwrap();
        assert_eq!(out.predicted.len(), 4);
        assert_eq!(out.new_memory.len(), 4);
        assert!(out.surprise.is_finite() && out.surprise >= 0.0);
    }

    #[test]
    fn test_forward_rejects_bad_lengths() {
        let mut model = small_model();
        assert!(matches!(
            model.forward(&[1.0; 3], &[0.0; 4]),
            Err(ModelError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            model.forward(&[1.0; 4], &[0.0; 5]),
            Err(ModelError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            model.train_step(&[1.0; 4], &[1.0; 2], &[0.0; 4]),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = MemoryModel::new(ModelConfig::with_dims(0, 8, 4), &mut rng());
        assert!(matches!(result, Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn test_forward_is_deterministic() {
        let mut model = small_model();
        let x = [0.3, -0.1, 0.7, 0.2];
        let m = [0.5, 0.1, -0.2, 0.0];
        let a = model.forward(&x, &m).unwrap();
        let b = model.forward(&x, &m).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_forward_accumulates_bank() {
        let mut model = small_model();
        let m = [0.5, 0.1, -0.2, 0.3];
        let x = [1.0, 0.0, 0.0, 0.0];

        model.forward(&x, &m).unwrap();
        let once = model.memory_bank().to_vec();
        model.forward(&x, &m).unwrap();
        let twice = model.memory_bank().to_vec();

        assert!(once[0].iter().any(|v| *v != 0.0));
        for (a, b) in once.iter().flatten().zip(twice.iter().flatten()) {
            assert_relative_eq!(*b, 2.0 * a, epsilon = 1e-12);
        }
        // Every layer receives the same update.
        assert_eq!(once[0], once[1]);

        model.reset_memory_bank();
        assert!(model.memory_bank().iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn test_forward_does_not_touch_optimized_params() {
        let mut model = small_model();
        let before = model.weights();
        model.forward(&[1.0, 0.0, 0.0, 0.0], &[0.2; 4]).unwrap();
        let after = model.weights();
        assert_eq!(before.optimized, after.optimized);
        assert_eq!(before.attention, after.attention);
        assert_ne!(before.memory_bank, after.memory_bank);
    }

    #[test]
    fn test_train_step_touches_only_optimized_group() {
        let mut model = small_model();
        let before = model.weights();
        let cost = model
            .train_step(&[1.0, 0.0, 0.0, 0.0], &[0.0, 1.0, 0.0, 0.0], &[0.2; 4])
            .unwrap();
        let after = model.weights();

        assert!(cost > 0.0);
        assert_ne!(before.optimized, after.optimized);
        assert_ne!(before.optimized.forget_gate, after.optimized.forget_gate);
        assert_eq!(before.attention, after.attention);
        assert_eq!(model.step_count(), 1);
    }

    #[test]
    fn test_train_step_cost_matches_forward_loss() {
        let mut model = small_model();
        let x = [0.2, 0.4, -0.3, 0.9];
        let xn = [0.1, 0.0, 0.5, -0.5];
        let m = [0.3, -0.3, 0.1, 0.0];
        let expected = loss(&mut model, &x, &xn, &m);
        let cost = model.train_step(&x, &xn, &m).unwrap();
        assert_relative_eq!(cost, expected, epsilon = 1e-12);
    }

    #[derive(Clone, Copy, Debug)]
    enum Coord {
        ForgetGate,
        B1(usize),
        W1(usize),
        B2(usize),
        W2(usize),
    }

    fn coord(p: &mut OptimizedParams, at: Coord) -> &mut f64 {
        match at {
            Coord::ForgetGate => &mut p.forget_gate,
            Coord::B1(i) => &mut p.b1[i],
            Coord::W1(i) => &mut p.w1.data[i],
            Coord::B2(i) => &mut p.b2[i],
            Coord::W2(i) => &mut p.w2.data[i],
        }
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut model = small_model();
        // Positive biases keep some hidden units active.
        model.optimized.b1.iter_mut().for_each(|b| *b = 0.1);
        let x = [0.2, 0.4, -0.3, 0.9];
        let xn = [0.1, 0.0, 0.5, -0.5];
        let m = [0.3, -0.3, 0.1, 0.4];

        let (out, cache) = model.forward_cached(&x, &m);
        let mut grads = model.backward(&cache, &x, &xn, &m, &out.predicted);
        // Memory split of the output does not enter the loss.
        assert_eq!(grads.b2[0], 0.0);

        let h = 1e-6;
        for at in [
            Coord::ForgetGate,
            Coord::B1(2),
            Coord::W1(2 * 8 + 5),
            Coord::B2(5),
            Coord::W2(6 * 8 + 3),
        ] {
            let analytic = *coord(&mut grads, at);
            let orig = *coord(&mut model.optimized, at);

            *coord(&mut model.optimized, at) = orig + h;
            let up = loss(&mut model, &x, &xn, &m);
            *coord(&mut model.optimized, at) = orig - h;
            let down = loss(&mut model, &x, &xn, &m);
            *coord(&mut model.optimized, at) = orig;

            let numeric = (up - down) / (2.0 * h);
            assert!(
                (numeric - analytic).abs() < 1e-6,
                "{at:?}: numeric {numeric} vs analytic {analytic}"
            );
        }
    }

    #[test]
    fn test_train_reduces_cost() {
        let mut model = small_model();
        let x = [1.0, 0.0, 0.0, 0.0];
        let m = [0.0; 4];
        let costs: Vec<f64> = (0..50)
            .map(|_| model.train_step(&x, &x, &m).unwrap())
            .collect();
        let first = linalg::mean(&costs[..5]);
        let last = linalg::mean(&costs[45..]);
        assert!(last < first, "cost did not fall: {first} -> {last}");
    }

    #[test]
    fn test_train_sequence_threads_memory() {
        let mut model = small_model();
        let seq: Vec<Vec<f64>> = (0..5)
            .map(|i| {
                let mut v = vec![0.0; 4];
                v[i % 4] = 1.0;
                v
            })
            .collect();
        let report = model.train_sequence(&seq, &[0.0; 4]).unwrap();
        assert_eq!(report.costs.len(), 4);
        assert_eq!(report.memory.len(), 4);
        assert!(report.mean_cost() > 0.0);
        assert_eq!(model.step_count(), 4);

        let empty = model.train_sequence(&seq[..1], &[0.0; 4]).unwrap();
        assert!(empty.costs.is_empty());
        assert_eq!(empty.memory, vec![0.0; 4]);
    }

    #[test]
    fn test_train_sequence_rejects_ragged_input() {
        let mut model = small_model();
        let seq = vec![vec![0.0; 4], vec![0.0; 3]];
        let err = model.train_sequence(&seq, &[0.0; 4]).unwrap_err();
        assert_eq!(err, ModelError::shape("sequence[1]", &[4], &[3]));
        assert_eq!(model.step_count(), 0);
    }

    #[test]
    fn test_non_finite_cost_reports_zero() {
        let mut model = small_model();
        let before = model.weights().optimized;
        let cost = model
            .train_step(&[f64::NAN, 0.0, 0.0, 0.0], &[0.0; 4], &[0.0; 4])
            .unwrap();
        assert_eq!(cost, 0.0);
        assert_eq!(model.step_count(), 0);
        assert_eq!(model.weights().optimized, before);
        assert!(model.weights().is_finite());
    }

    #[test]
    fn test_overflowing_forward_keeps_bank() {
        let mut model = small_model();
        let before = model.memory_bank().to_vec();
        model.forward(&[1e308; 4], &[1e308; 4]).unwrap();
        assert_eq!(model.memory_bank(), before.as_slice());
        assert!(model.weights().is_finite());
    }

    #[test]
    fn test_load_weights_checks_shapes() {
        let mut model = small_model();
        let other = MemoryModel::new(ModelConfig::with_dims(4, 6, 4), &mut rng()).unwrap();
        let err = model.load_weights(other.weights()).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));

        let mut other_rng = SmallRng::seed_from_u64(7);
        let donor = MemoryModel::new(ModelConfig::with_dims(4, 8, 4), &mut other_rng).unwrap();
        model.load_weights(donor.weights()).unwrap();
        assert_eq!(model.weights(), donor.weights());
    }
}
