//! User-defined framework shim.
//!
//! Any `[frameworks.<name>]` section whose name is not a built-in defines a
//! custom framework. It claims files by regular expression and reports no
//! summary counts, so only return codes decide its failures.
//!
//! ```toml
//! [frameworks.minitest]
//! order = 2
//! root = "test"
//! pattern = "_test\\.rb$"
//! worker_command = "bundle exec nitra-worker minitest"
//! setup_command = "bin/rails runner 'Rails.application.eager_load!'"
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;

use super::{FrameworkError, FrameworkResult, FrameworkShim, ShimCommands};
use crate::config::FrameworkConfig;

/// Order given to custom frameworks that do not set one.
const DEFAULT_ORDER: i32 = 100;

#[derive(Debug, Clone)]
pub struct CustomShim {
    name: String,
    order: i32,
    root: PathBuf,
    pattern: Regex,
    minimal_file: String,
    commands: ShimCommands,
}

impl CustomShim {
    pub fn from_config(name: &str, config: &FrameworkConfig) -> FrameworkResult<Self> {
        let invalid = |reason: String| FrameworkError::InvalidConfig {
            framework: name.to_string(),
            reason,
        };

        let pattern = config
            .pattern
            .as_deref()
            .ok_or_else(|| invalid("pattern is required".to_string()))?;
        let pattern = Regex::new(pattern).map_err(|e| invalid(format!("pattern: {}", e)))?;

        if config.worker_command.is_none() {
            return Err(invalid("worker_command is required".to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            order: config.order.unwrap_or(DEFAULT_ORDER),
            root: config.root.clone().unwrap_or_else(|| PathBuf::from(".")),
            pattern,
            minimal_file: config.minimal_file.clone().unwrap_or_default(),
            commands: ShimCommands::from_config(name, config, &[])?,
        })
    }
}

#[async_trait]
impl FrameworkShim for CustomShim {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn matches(&self, filename: &str) -> bool {
        self.pattern.is_match(filename)
    }

    fn minimal_file(&self) -> &str {
        &self.minimal_file
    }

    fn fixture_suffix(&self) -> &str {
        ""
    }

    fn commands(&self) -> &ShimCommands {
        &self.commands
    }
}
