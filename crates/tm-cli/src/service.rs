//! Operations shared by the MCP tools, the HTTP routes and the WebSocket
//! actions. Every method returns the JSON payload the transports send back.

use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::SmallRng;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tm_core::{ModelConfig, angular_distance};
use tm_store::{Store, load_model, save_model};

use crate::session::{Result, Session, SessionError};

// --- Request types ---

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct InitRequest {
    /// Partial model config using wire names (inputDim, hiddenDim, outputDim,
    /// learningRate, useManifold, numHeads, numLayers, ...). Missing fields
    /// keep the server's configured values.
    #[serde(default)]
    pub config: Option<Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ForwardRequest {
    /// Input vector of length inputDim
    pub x: Vec<f64>,
    /// Memory vector of length outputDim. Defaults to the session's current memory.
    #[serde(default)]
    pub memory: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TrainRequest {
    /// Current input vector
    pub x_t: Vec<f64>,
    /// Next input vector the model should predict
    pub x_next: Vec<f64>,
    /// Memory vector. Defaults to the session's current memory.
    #[serde(default)]
    pub memory: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TrainSequenceRequest {
    /// Ordered input vectors; every consecutive pair is one train step
    pub sequence: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ManifoldRequest {
    /// Starting point (unit-norm when the manifold is enabled)
    pub base: Vec<f64>,
    /// Step direction and magnitude
    pub velocity: Vec<f64>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct CheckpointRequest {
    /// File path for a JSON checkpoint
    #[serde(default)]
    pub path: Option<String>,
    /// Name of a checkpoint in the data directory's database
    #[serde(default)]
    pub name: Option<String>,
}

/// WebSocket message: `{ "action": "<name>", ...fields }`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Init(InitRequest),
    Forward(ForwardRequest),
    Train(TrainRequest),
    TrainSequence(TrainSequenceRequest),
    Manifold(ManifoldRequest),
    Memory,
    Config,
    Reset,
    Save(CheckpointRequest),
    Load(CheckpointRequest),
    Checkpoints,
}

enum Checkpoint {
    File(PathBuf),
    Named(String),
}

impl Checkpoint {
    fn from_request(req: CheckpointRequest) -> Result<Self> {
        match (req.path, req.name) {
            (Some(path), None) if !path.is_empty() => Ok(Checkpoint::File(PathBuf::from(path))),
            (None, Some(name)) if !name.is_empty() => Ok(Checkpoint::Named(name)),
            _ => Err(SessionError::BadRequest(
                "exactly one of `path` or `name` is required".to_string(),
            )),
        }
    }
}

/// Overlay a partial wire-form config on `base`.
fn merge_config(base: &ModelConfig, patch: Option<&Value>) -> Result<ModelConfig> {
    let Some(patch) = patch else {
        return Ok(base.clone());
    };
    let Value::Object(fields) = patch else {
        return Err(SessionError::BadRequest(
            "config must be a JSON object".to_string(),
        ));
    };

    let mut merged = serde_json::to_value(base)
        .map_err(|e| SessionError::BadRequest(format!("config: {e}")))?;
    if let Value::Object(target) = &mut merged {
        if fields.contains_key("memoryDim") {
            target.remove("outputDim");
        }
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(merged).map_err(|e| SessionError::BadRequest(format!("config: {e}")))
}

pub struct Service {
    session: Session,
    defaults: ModelConfig,
    rng: SmallRng,
    db_path: PathBuf,
}

impl Service {
    pub fn new(config: ModelConfig, db_path: PathBuf) -> Result<Self> {
        Self::with_rng(config, db_path, SmallRng::from_os_rng())
    }

    pub fn with_rng(config: ModelConfig, db_path: PathBuf, mut rng: SmallRng) -> Result<Self> {
        let session = Session::new(config.clone(), &mut rng)?;
        Ok(Self {
            session,
            defaults: config,
            rng,
            db_path,
        })
    }

    /// A fresh, independent session with this service's current config.
    pub fn fork(&self) -> Result<Self> {
        let mut fork = Self::new(self.session.config().clone(), self.db_path.clone())?;
        fork.defaults = self.defaults.clone();
        Ok(fork)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn dispatch(&mut self, action: Action) -> Result<Value> {
        match action {
            Action::Init(req) => self.init(req),
            Action::Forward(req) => self.forward(req),
            Action::Train(req) => self.train(req),
            Action::TrainSequence(req) => self.train_sequence(req),
            Action::Manifold(req) => self.manifold(req),
            Action::Memory => Ok(self.memory_state()),
            Action::Config => Ok(self.config()),
            Action::Reset => Ok(self.reset()),
            Action::Save(req) => self.save(req),
            Action::Load(req) => self.load(req),
            Action::Checkpoints => self.checkpoints(),
        }
    }

    pub fn init(&mut self, req: InitRequest) -> Result<Value> {
        let config = merge_config(&self.defaults, req.config.as_ref())?;
        self.session.reinit(config, &mut self.rng)?;
        tracing::info!(session = %self.session.id(), "model initialized");
        Ok(json!({
            "status": "initialized",
            "sessionId": self.session.id(),
            "config": self.session.config(),
        }))
    }

    pub fn forward(&mut self, req: ForwardRequest) -> Result<Value> {
        let out = self.session.forward(&req.x, req.memory.as_deref())?;
        Ok(json!({
            "predicted": out.predicted,
            "newMemory": out.new_memory,
            "surprise": out.surprise,
            "surpriseEma": self.session.surprise_ema(),
        }))
    }

    pub fn train(&mut self, req: TrainRequest) -> Result<Value> {
        let out = self
            .session
            .train(&req.x_t, &req.x_next, req.memory.as_deref())?;
        tracing::debug!(cost = out.cost, steps = self.session.steps(), "train step");
        Ok(json!({
            "cost": out.cost,
            "predicted": out.forward.predicted,
            "newMemory": out.forward.new_memory,
            "surprise": out.forward.surprise,
            "steps": self.session.steps(),
        }))
    }

    pub fn train_sequence(&mut self, req: TrainSequenceRequest) -> Result<Value> {
        let report = self.session.train_sequence(&req.sequence)?;
        Ok(json!({
            "costs": report.costs,
            "meanCost": report.mean_cost(),
            "memory": report.memory,
            "steps": self.session.steps(),
            "surpriseEma": self.session.surprise_ema(),
        }))
    }

    pub fn manifold(&self, req: ManifoldRequest) -> Result<Value> {
        let result = self.session.manifold_step(&req.base, &req.velocity)?;
        Ok(json!({
            "angle": angular_distance(&req.base, &result),
            "useManifold": self.session.config().use_manifold,
            "result": result,
        }))
    }

    pub fn memory_state(&self) -> Value {
        serde_json::to_value(self.session.state()).unwrap_or_default()
    }

    pub fn config(&self) -> Value {
        serde_json::to_value(self.session.config()).unwrap_or_default()
    }

    pub fn reset(&mut self) -> Value {
        self.session.reset_memory();
        json!({ "status": "reset", "memory": self.session.memory() })
    }

    pub fn save(&self, req: CheckpointRequest) -> Result<Value> {
        match Checkpoint::from_request(req)? {
            Checkpoint::File(path) => {
                save_model(self.session.model(), &path)?;
                Ok(json!({ "saved": path, "kind": "file" }))
            }
            Checkpoint::Named(name) => {
                let store = Store::open(&self.db_path)?;
                store.save_checkpoint(&name, self.session.model())?;
                store.save_session(&self.session.to_record(Some(&name)))?;
                Ok(json!({ "saved": name, "kind": "store" }))
            }
        }
    }

    /// Load weights into the live model. Named checkpoints also bring back
    /// the memory vector saved alongside them.
    pub fn load(&mut self, req: CheckpointRequest) -> Result<Value> {
        match Checkpoint::from_request(req)? {
            Checkpoint::File(path) => {
                load_model(self.session.model_mut(), &path)?;
                Ok(json!({ "loaded": path, "kind": "file" }))
            }
            Checkpoint::Named(name) => {
                let store = Store::open(&self.db_path)?;
                if !store.load_checkpoint(&name, self.session.model_mut())? {
                    return Err(SessionError::NotFound(format!("checkpoint '{name}'")));
                }
                let record = store.latest_session_for(&name)?;
                if let Some(record) = &record {
                    self.session.restore_record(record)?;
                }
                Ok(json!({
                    "loaded": name,
                    "kind": "store",
                    "sessionRestored": record.is_some(),
                }))
            }
        }
    }

    pub fn checkpoints(&self) -> Result<Value> {
        let store = Store::open(&self.db_path)?;
        let list: Vec<Value> = store
            .list_checkpoints()?
            .into_iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "savedAt": c.saved_at,
                    "steps": c.steps,
                    "bytes": c.bytes,
                })
            })
            .collect();
        Ok(json!({ "checkpoints": list }))
    }
}
