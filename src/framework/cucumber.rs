//! Cucumber framework shim.
//!
//! Files are `*.feature` under `features/`. Cucumber reports scenarios rather
//! than examples; failed and undefined scenarios both count as failures:
//!
//! ```text
//! 5 scenarios (1 failed, 1 undefined, 3 passed)
//! 23 steps (1 failed, 2 skipped, 1 undefined, 19 passed)
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::{FrameworkResult, FrameworkShim, ShimCommands, Summary};
use crate::config::FrameworkConfig;

/// Registry name of the Cucumber shim.
pub const NAME: &str = "cucumber";

const DEFAULT_WORKER: &[&str] = &["bundle", "exec", "nitra-worker", "cucumber"];

const MINIMAL_FILE: &str = "\
Feature: nitra preload
  Scenario: load the environment
    Given no step is defined
    Then cucumber has loaded its environment
";

/// Scenario total, with the per-status breakdown in group 2.
static SCENARIOS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) scenarios?\b(?: \(([^)]*)\))?").expect("scenario regex is valid")
});

static FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (?:failed|undefined)").expect("failure regex is valid"));

#[derive(Debug, Clone)]
pub struct CucumberShim {
    order: i32,
    root: PathBuf,
    minimal_file: String,
    commands: ShimCommands,
}

impl CucumberShim {
    pub fn from_config(config: &FrameworkConfig) -> FrameworkResult<Self> {
        Ok(Self {
            order: config.order.unwrap_or(1),
            root: config.root.clone().unwrap_or_else(|| PathBuf::from("features")),
            minimal_file: config
                .minimal_file
                .clone()
                .unwrap_or_else(|| MINIMAL_FILE.to_string()),
            commands: ShimCommands::from_config(NAME, config, DEFAULT_WORKER)?,
        })
    }
}

impl Default for CucumberShim {
    fn default() -> Self {
        Self {
            order: 1,
            root: PathBuf::from("features"),
            minimal_file: MINIMAL_FILE.to_string(),
            commands: ShimCommands {
                worker_command: DEFAULT_WORKER.iter().map(|s| s.to_string()).collect(),
                setup_command: None,
            },
        }
    }
}

#[async_trait]
impl FrameworkShim for CucumberShim {
    fn name(&self) -> &str {
        NAME
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn matches(&self, filename: &str) -> bool {
        filename.contains(".feature")
    }

    fn minimal_file(&self) -> &str {
        &self.minimal_file
    }

    fn fixture_suffix(&self) -> &str {
        ".feature"
    }

    fn commands(&self) -> &ShimCommands {
        &self.commands
    }

    fn summarize(&self, output: &str) -> Option<Summary> {
        let scenarios = SCENARIOS_RE.captures(output)?;
        let mut failure_count = 0;
        if let Some(breakdown) = scenarios.get(2) {
            for failed in FAILED_RE.captures_iter(breakdown.as_str()) {
                failure_count += failed[1].parse::<u64>().ok()?;
            }
        }

        Some(Summary {
            example_count: scenarios[1].parse().ok()?,
            failure_count,
        })
    }
}
