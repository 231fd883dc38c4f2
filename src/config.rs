//! Configuration loading and schema definitions for nitra.
//!
//! This module provides types and functions for loading nitra configuration
//! from TOML files or strings. Every section is optional; a missing file is
//! equivalent to an empty one.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads nitra configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use nitra::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("nitra.toml"))?;
/// println!("Processes: {}", config.nitra.process_count);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads the configuration file if it exists, falling back to defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!("{} not found, using default configuration", path.display());
        Ok(Config::default())
    }
}

/// Loads nitra configuration from a TOML string.
///
/// # Example
///
/// ```
/// use nitra::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [nitra]
///     process_count = 4
///     frameworks = ["rspec", "cucumber"]
///
///     [[slaves]]
///     host = "ci-box-2"
///     capacity = 8
/// "#)?;
///
/// assert_eq!(config.nitra.process_count, 4);
/// assert_eq!(config.slaves[0].capacity, 8);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
