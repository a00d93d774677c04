use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Storage backend configuration.
    pub storage: StorageConfig,
}

/// Which storage implementation the factory builds.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Process-lifetime map, lost on exit.
    #[default]
    Memory,
    /// Content-addressed files under `path`.
    Disk,
}

/// The `[storage]` table.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: Backend,
    /// Base directory of the disk backend. Required when `backend = "disk"`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// In-memory backend, no settings.
    pub fn memory() -> Self {
        Self { backend: Backend::Memory, path: None }
    }

    /// Disk backend rooted at `path`.
    pub fn disk(path: impl Into<PathBuf>) -> Self {
        Self { backend: Backend::Disk, path: Some(path.into()) }
    }

    /// Build from a flat `storage.*` key/value mapping, as handed over by the
    /// proxy's own configuration loader. Unknown keys are ignored.
    ///
    /// A mapping with `storage.path` but no `storage.backend` selects disk.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let path = map.get("storage.path").map(PathBuf::from);
        let backend = match map.get("storage.backend").map(|s| s.trim().to_ascii_lowercase()) {
            Some(b) if b == "memory" => Backend::Memory,
            Some(b) if b == "disk" => Backend::Disk,
            Some(other) => {
                return Err(StoreError::Config(format!("Unknown storage backend '{other}'")))
            }
            None if path.is_some() => Backend::Disk,
            None => Backend::Memory,
        };
        let cfg = Self { backend, path };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend == Backend::Disk {
            match &self.path {
                None => {
                    return Err(StoreError::Config("storage.path is required for the disk backend".into()))
                }
                Some(p) if p.as_os_str().is_empty() => {
                    return Err(StoreError::Config("storage.path must not be empty".into()))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("Cannot read config file: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| StoreError::Config(format!("Invalid TOML: {e}")))?;
        config.storage.validate()?;
        Ok(config)
    }
}
