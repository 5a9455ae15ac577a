//! Bridge configuration.
//!
//! Loaded from JSON (every field optional) and then overridden from the
//! environment: `VDEV_CALL_TIMEOUT_MS`, `VDEV_SHM_DIR`, `VDEV_BACKEND`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::Deserialize;
use thiserror::Error;

pub const ENV_CALL_TIMEOUT_MS: &str = "VDEV_CALL_TIMEOUT_MS";
pub const ENV_SHM_DIR: &str = "VDEV_SHM_DIR";
pub const ENV_BACKEND: &str = "VDEV_BACKEND";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bus reply timeout for every call.
    pub call_timeout_ms: u64,
    /// Directory holding shared segments.
    pub shm_dir: PathBuf,
    /// Backend resolved by the server at first `open`.
    pub backend_library: String,
    /// Largest NodeId a directory built from this config hands out.
    pub max_node_id: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            shm_dir: transport::default_segment_dir(),
            backend_library: "libvdev-codec.so".to_owned(),
            max_node_id: u32::MAX >> 1,
        }
    }
}

impl BridgeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_json(&text)?;
        debug!("loaded bridge config from {}", path.display());
        cfg.with_env()
    }

    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_CALL_TIMEOUT_MS) {
            self.call_timeout_ms = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_CALL_TIMEOUT_MS,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_SHM_DIR) {
            self.shm_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_BACKEND) {
            self.backend_library = value;
        }
        Ok(self)
    }
}
