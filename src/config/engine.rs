//! Engine configuration
//!
//! Process-wide defaults, loaded once from TOML. The bundled
//! `files/engine.toml` is used unless `JAILRUN_ENGINE_CONFIG` points elsewhere.

use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use super::{validate_mounts, Mount};

const BUNDLED: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/engine.toml"));

/// Environment variable naming an engine config file
pub const ENGINE_CONFIG_ENV: &str = "JAILRUN_ENGINE_CONFIG";

/// Engine-wide settings shared by every invocation
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Mounts laid down before the invocation's own mounts
    #[serde(default)]
    pub base_mounts: Vec<Mount>,
    /// Default executable search path inside the sandbox view
    #[serde(default = "default_search_path")]
    pub search_path: Vec<PathBuf>,
    /// Delay between SIGTERM and SIGKILL when a group is terminated
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Where per-invocation view roots are created (default: temp dir)
    #[serde(default)]
    pub work_root: Option<PathBuf>,
}

fn default_search_path() -> Vec<PathBuf> {
    ["/usr/local/sbin", "/usr/local/bin", "/usr/sbin", "/usr/bin", "/sbin", "/bin"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

fn default_kill_grace_ms() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_mounts: Vec::new(),
            search_path: default_search_path(),
            kill_grace_ms: default_kill_grace_ms(),
            work_root: None,
        }
    }
}

impl EngineConfig {
    /// Load from `JAILRUN_ENGINE_CONFIG` if set, otherwise the bundled defaults
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(ENGINE_CONFIG_ENV) {
            Ok(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read engine config {}", path))?;
                let config = Self::from_toml(&content)
                    .with_context(|| format!("Invalid engine config {}", path))?;
                info!("Loaded engine configuration from {}", path);
                Ok(config)
            }
            Err(_) => Self::bundled(),
        }
    }

    /// The configuration compiled into the binary
    pub fn bundled() -> anyhow::Result<Self> {
        Self::from_toml(BUNDLED).context("Invalid bundled engine config")
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        validate_mounts(&config.base_mounts)?;
        Ok(config)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn work_root(&self) -> PathBuf {
        self.work_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}
