//! # silo-config
//!
//! Configuration for the silo binaries.
//!
//! Layered, lowest priority first:
//! 1. built-in defaults
//! 2. `~/.silo/config.toml` (global)
//! 3. `silo.toml` in the working directory (project-local)
//! 4. environment variables (`SILO_SOCKET`, `SILO_CHUNK_SIZE`)
//!
//! [`Config::load`] returns an owned value; there is no process-global
//! configuration state.

pub mod logging;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the standard locations.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        let project_path = Path::new("silo.toml");
        if project_path.exists() {
            debug!("loading project config from {:?}", project_path);
            config = Self::from_file(project_path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: `~/.silo/config.toml`.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".silo/config.toml"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(socket) = std::env::var("SILO_SOCKET") {
            self.daemon.socket = PathBuf::from(socket);
        }
        if let Ok(chunk_size) = std::env::var("SILO_CHUNK_SIZE") {
            if let Ok(n) = chunk_size.parse() {
                self.store.chunk_size = n;
            }
        }
    }

    /// Render the defaults as a TOML skeleton.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket the daemon listens on.
    pub socket: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/tmp/silod.sock"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Chunking granularity the upload tool splits content with, in bytes.
    pub chunk_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { chunk_size: 65536 }
    }
}
