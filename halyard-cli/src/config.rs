//! Config file discovery for the CLI.
//!
//! The engine config lives at `~/.config/halyard/halyard.toml` unless
//! `--config` points elsewhere.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use halyard_sdk::config::EngineConfig;

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("halyard")
}

pub fn default_path() -> PathBuf {
    config_dir().join("halyard.toml")
}

/// `explicit` when given, the default location otherwise.
pub fn resolve(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(default_path, Path::to_path_buf)
}

/// Load and validate the engine config at `path`.
///
/// A relative `sts_store` is taken relative to the config file.
pub fn load(path: &Path) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    if let Some(store) = config.sts_store.take() {
        let store = match path.parent() {
            Some(dir) if store.is_relative() => dir.join(store),
            _ => store,
        };
        config.sts_store = Some(store);
    }
    Ok(config)
}
