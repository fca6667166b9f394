//! Titan sequence-memory model.
//!
//! A small gated MLP predicts the next vector of a sequence from the current
//! one plus a memory vector. Prediction error against the current input is
//! reported as surprise, a multi-head attention read-out feeds a layered
//! memory bank, and training runs Adam over a hand-derived backward pass.
//! A geodesic step on the unit hypersphere is available alongside.
//!
//! Zero I/O. Persistence and transport live in `tm-store` and `tm-cli`.

pub mod attention;
pub mod config;
pub mod constants;
pub mod error;
pub mod linalg;
pub mod manifold;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod serde_compat;

pub use config::{MemoryBankPolicy, ModelConfig};
pub use error::{ModelError, Result};
pub use manifold::{ManifoldOptions, angular_distance, manifold_step};
pub use model::{ForwardOutput, MemoryModel, SequenceReport, TrainOutput};
pub use params::ModelWeights;
pub use serde_compat::{
    CURRENT_VERSION, export_bytes, export_json, import_bytes, import_json, restore_json,
};
