use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::engine::EngineConfig;

/// Configuration loaded from `vaultflow.yaml`.
/// All fields are optional — missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct VaultflowConfig {
    /// Directory of the JSON flow store.
    pub store_dir: Option<String>,
    /// SQLite database URL; takes precedence over `store_dir` when set.
    pub database_url: Option<String>,
    /// Engine tunables (event tail, branch depth cap, sweep interval, caps).
    pub engine: Option<EngineConfig>,
}

impl VaultflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `vaultflow.yaml` in cwd; return
    ///   defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("vaultflow.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: VaultflowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    /// Engine config resolved from file + environment overrides.
    pub fn engine_config(&self) -> EngineConfig {
        self.engine
            .clone()
            .unwrap_or_default()
            .with_env_overrides()
    }
}
