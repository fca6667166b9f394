//! Layered settings: built-in defaults, an optional TOML file, then the
//! `TITAN_DATA_DIR` environment override.
//!
//! ```toml
//! data_dir = "/var/lib/titan"
//!
//! [model]
//! inputDim = 16
//! outputDim = 16
//! memoryBankPolicy = { kind = "decay", factor = 0.95 }
//!
//! [server]
//! port = 8080
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tm_core::ModelConfig;

use crate::error::{Result, StoreError};

pub const DATA_DIR_ENV: &str = "TITAN_DATA_DIR";
pub const DB_FILE: &str = "titan.db";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: ModelConfig,
    pub server: ServerSettings,
    pub data_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.model.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        Self::from_toml(&content)
    }

    /// File settings when `path` is given, defaults otherwise, with the
    /// environment override applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        if let Ok(dir) = env::var(DATA_DIR_ENV)
            && !dir.is_empty()
        {
            settings.data_dir = Some(PathBuf::from(dir));
        }
        tracing::debug!(?settings, "settings loaded");
        Ok(settings)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join(DB_FILE)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| StoreError::InvalidData(e.to_string()))
    }
}

/// `$TITAN_DATA_DIR`, else `~/.titan-memory`.
pub fn default_data_dir() -> PathBuf {
    resolve_data_dir(
        env::var(DATA_DIR_ENV).ok(),
        env::var("HOME").or_else(|_| env::var("USERPROFILE")).ok(),
    )
}

fn resolve_data_dir(override_dir: Option<String>, home: Option<String>) -> PathBuf {
    match override_dir.filter(|d| !d.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => home
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".titan-memory"),
    }
}
