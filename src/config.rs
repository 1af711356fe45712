//! Layered settings: built-in defaults, then an optional TOML/JSON/YAML file,
//! then `KNOTGRAPH_*` environment variables (`__` separates nested keys, as in
//! `KNOTGRAPH_JOURNAL__PATH=graph.db`).

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt};

use crate::construct::PersistenceMode;
use crate::error::{KnotError, Result};

pub const ENV_PREFIX: &str = "KNOTGRAPH";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub journal: JournalSettings,
    pub engine: EngineSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalSettings {
    /// SQLite file holding the journal. Without one the journal lives in memory.
    pub path: Option<String>,
    /// Write a checkpoint after this many commits; 0 turns it off.
    pub checkpoint_interval: u64,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self { path: None, checkpoint_interval: 1000 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Adding an existing node or edge key fails instead of overwriting it.
    pub reject_duplicates: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { filter: "info".to_string() }
    }
}

impl LogSettings {
    /// Installs a global fmt subscriber. `RUST_LOG` wins over the configured filter.
    pub fn init(&self) -> Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .map_err(|e| KnotError::Config(format!("invalid log filter '{}': {e}", self.filter)))?;
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .map_err(|e| KnotError::Config(format!("logging already initialized: {e}")))
    }
}

impl Settings {
    /// Reads settings from `path` (if given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        match &self.journal.path {
            Some(path) => PersistenceMode::File(path.clone()),
            None => PersistenceMode::InMemory,
        }
    }
}
