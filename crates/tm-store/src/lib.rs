pub mod checkpoint;
pub mod error;
pub mod schema;
pub mod settings;
pub mod store;

pub use checkpoint::{load_model, restore_model, save_model};
pub use error::{Result, StoreError};
pub use settings::{ServerSettings, Settings, default_data_dir};
pub use store::{CheckpointInfo, SessionRecord, Store};
