//! One live model plus the memory vector threaded through it.

use std::fmt;

use rand::Rng;
use serde::Serialize;
use tm_core::{ForwardOutput, MemoryModel, ModelConfig, ModelError, SequenceReport, TrainOutput};
use tm_store::{SessionRecord, StoreError};
use uuid::Uuid;

#[derive(Debug)]
pub enum SessionError {
    Model(ModelError),
    Store(StoreError),
    NotFound(String),
    BadRequest(String),
}

impl SessionError {
    /// Caller mistakes: wrong shapes, bad config, malformed payloads.
    pub fn is_client_error(&self) -> bool {
        match self {
            SessionError::Model(_) | SessionError::BadRequest(_) => true,
            SessionError::Store(StoreError::Model(_)) => true,
            SessionError::Store(_) => false,
            SessionError::NotFound(_) => true,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Model(e) => write!(f, "{e}"),
            SessionError::Store(e) => write!(f, "{e}"),
            SessionError::NotFound(what) => write!(f, "not found: {what}"),
            SessionError::BadRequest(msg) => write!(f, "bad request: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ModelError> for SessionError {
    fn from(e: ModelError) -> Self {
        SessionError::Model(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Snapshot returned by `get_memory_state`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryState {
    pub session_id: Uuid,
    pub memory: Vec<f64>,
    pub steps: u64,
    pub optimizer_steps: u64,
    pub last_surprise: Option<f64>,
    pub surprise_ema: Option<f64>,
    pub memory_bank: Vec<Vec<f64>>,
}

pub struct Session {
    id: Uuid,
    model: MemoryModel,
    memory: Vec<f64>,
    steps: u64,
    last_surprise: Option<f64>,
    surprise_ema: Option<f64>,
}

impl Session {
    pub fn new(config: ModelConfig, rng: &mut impl Rng) -> Result<Self> {
        let model = MemoryModel::new(config, rng)?;
        let memory = model.zero_memory();
        Ok(Self {
            id: Uuid::new_v4(),
            model,
            memory,
            steps: 0,
            last_surprise: None,
            surprise_ema: None,
        })
    }

    /// Replace model, memory and counters wholesale. On error the old
    /// session is kept.
    pub fn reinit(&mut self, config: ModelConfig, rng: &mut impl Rng) -> Result<()> {
        *self = Self::new(config, rng)?;
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ModelConfig {
        self.model.config()
    }

    pub fn model(&self) -> &MemoryModel {
        &self.model
    }

    pub fn memory(&self) -> &[f64] {
        &self.memory
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn surprise_ema(&self) -> Option<f64> {
        self.surprise_ema
    }

    fn observe(&mut self, surprise: f64) {
        let m = self.model.config().momentum_factor;
        self.last_surprise = Some(surprise);
        self.surprise_ema = Some(match self.surprise_ema {
            Some(prev) => m * prev + (1.0 - m) * surprise,
            None => surprise,
        });
    }

    /// Forward from `memory` (or the session's own vector) and adopt the
    /// returned memory.
    pub fn forward(&mut self, x: &[f64], memory: Option<&[f64]>) -> Result<ForwardOutput> {
        let memory = memory.unwrap_or(self.memory.as_slice()).to_vec();
        let out = self.model.forward(x, &memory)?;
        self.memory.clone_from(&out.new_memory);
        self.observe(out.surprise);
        Ok(out)
    }

    pub fn train(
        &mut self,
        x_t: &[f64],
        x_next: &[f64],
        memory: Option<&[f64]>,
    ) -> Result<TrainOutput> {
        let memory = memory.unwrap_or(self.memory.as_slice()).to_vec();
        let out = self.model.train_step_with_output(x_t, x_next, &memory)?;
        self.memory.clone_from(&out.forward.new_memory);
        self.steps += 1;
        self.observe(out.forward.surprise);
        Ok(out)
    }

    pub fn train_sequence(&mut self, sequence: &[Vec<f64>]) -> Result<SequenceReport> {
        let report = self.model.train_sequence(sequence, &self.memory)?;
        self.memory.clone_from(&report.memory);
        self.steps += report.costs.len() as u64;
        for &surprise in &report.surprises {
            self.observe(surprise);
        }
        Ok(report)
    }

    pub fn manifold_step(&self, base: &[f64], velocity: &[f64]) -> Result<Vec<f64>> {
        Ok(self.model.manifold_step(base, velocity)?)
    }

    /// Zero the memory vector and the model's memory bank. Weights stay.
    pub fn reset_memory(&mut self) {
        self.memory = self.model.zero_memory();
        self.model.reset_memory_bank();
        self.last_surprise = None;
        self.surprise_ema = None;
    }

    pub fn state(&self) -> MemoryState {
        MemoryState {
            session_id: self.id,
            memory: self.memory.clone(),
            steps: self.steps,
            optimizer_steps: self.model.step_count(),
            last_surprise: self.last_surprise,
            surprise_ema: self.surprise_ema,
            memory_bank: self.model.memory_bank().to_vec(),
        }
    }

    pub fn model_mut(&mut self) -> &mut MemoryModel {
        &mut self.model
    }

    pub fn to_record(&self, checkpoint: Option<&str>) -> SessionRecord {
        SessionRecord {
            id: self.id,
            checkpoint: checkpoint.map(str::to_string),
            memory: self.memory.clone(),
            steps: self.steps,
            surprise_ema: self.surprise_ema.unwrap_or(0.0),
        }
    }

    /// Adopt a persisted memory vector and counters.
    pub fn restore_record(&mut self, record: &SessionRecord) -> Result<()> {
        ModelError::check_len("memory", self.config().memory_dim, record.memory.len())?;
        self.memory.clone_from(&record.memory);
        self.steps = record.steps;
        self.surprise_ema = (record.steps > 0).then_some(record.surprise_ema);
        Ok(())
    }
}
