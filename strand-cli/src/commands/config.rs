//! Load and print the runtime configuration.

use anyhow::{Context, Result};
use std::path::Path;
use strand_core::RuntimeConfig;

/// Read the configuration file, or fall back to the defaults when absent
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no configuration file, using defaults");
        return Ok(RuntimeConfig::default());
    }
    RuntimeConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

pub fn show_config(config: &RuntimeConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        print!("{}", config.to_yaml()?);
    }
    Ok(())
}
