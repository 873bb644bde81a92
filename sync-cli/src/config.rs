//! Configuration loading for the CLI.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use sync_client::Config;

/// Load the config file if given, then apply command-line overrides.
pub fn load(path: Option<&Path>, db: Option<PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(db) = db {
        config.store.database = db;
    }
    Ok(config)
}
