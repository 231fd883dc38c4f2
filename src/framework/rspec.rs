//! RSpec framework shim.
//!
//! Files are `*_spec.rb` under `spec/`. RSpec prints one summary line per
//! run:
//!
//! ```text
//! 42 examples, 3 failures, 1 pending
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::{FrameworkResult, FrameworkShim, ShimCommands, Summary};
use crate::config::FrameworkConfig;

/// Registry name of the RSpec shim.
pub const NAME: &str = "rspec";

const DEFAULT_WORKER: &[&str] = &["bundle", "exec", "nitra-worker", "rspec"];

const MINIMAL_FILE: &str = "\
require 'spec_helper'

RSpec.describe 'nitra preload' do
  it 'loads the environment' do
    expect(true).to be(true)
  end
end
";

static SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) examples?, (\d+) failures?").expect("summary regex is valid"));

#[derive(Debug, Clone)]
pub struct RspecShim {
    order: i32,
    root: PathBuf,
    minimal_file: String,
    commands: ShimCommands,
}

impl RspecShim {
    pub fn from_config(config: &FrameworkConfig) -> FrameworkResult<Self> {
        Ok(Self {
            order: config.order.unwrap_or(0),
            root: config.root.clone().unwrap_or_else(|| PathBuf::from("spec")),
            minimal_file: config
                .minimal_file
                .clone()
                .unwrap_or_else(|| MINIMAL_FILE.to_string()),
            commands: ShimCommands::from_config(NAME, config, DEFAULT_WORKER)?,
        })
    }
}

impl Default for RspecShim {
    fn default() -> Self {
        Self {
            order: 0,
            root: PathBuf::from("spec"),
            minimal_file: MINIMAL_FILE.to_string(),
            commands: ShimCommands {
                worker_command: DEFAULT_WORKER.iter().map(|s| s.to_string()).collect(),
                setup_command: None,
            },
        }
    }
}

#[async_trait]
impl FrameworkShim for RspecShim {
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
        filename.contains("_spec")
    }

    fn minimal_file(&self) -> &str {
        &self.minimal_file
    }

    fn fixture_suffix(&self) -> &str {
        "_spec.rb"
    }

    fn commands(&self) -> &ShimCommands {
        &self.commands
    }

    fn summarize(&self, output: &str) -> Option<Summary> {
        let captures = SUMMARY_RE.captures(output)?;
        Some(Summary {
            example_count: captures[1].parse().ok()?,
            failure_count: captures[2].parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_spec_files() {
        let shim = RspecShim::default();
        assert!(shim.matches("spec/models/user_spec.rb"));
        assert!(!shim.matches("features/login.feature"));
        assert!(!shim.matches("spec/support/helpers.rb"));
    }

    #[test]
    fn test_summary_singular_and_plural() {
        let shim = RspecShim::default();

        assert_eq!(
            shim.summarize("1 example, 0 failures"),
            Some(Summary {
                example_count: 1,
                failure_count: 0
            })
        );
        assert_eq!(
            shim.summarize("..F\n\n12 examples, 1 failure, 2 pending\n"),
            Some(Summary {
                example_count: 12,
                failure_count: 1
            })
        );
        assert_eq!(shim.summarize("No examples found."), None);
    }

    #[test]
    fn test_config_overrides() {
        let shim = RspecShim::from_config(&FrameworkConfig {
            worker_command: Some("bin/worker --fast".to_string()),
            root: Some(PathBuf::from("test/spec")),
            order: Some(5),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(shim.order(), 5);
        assert_eq!(shim.root(), Path::new("test/spec"));
        assert_eq!(shim.commands().worker_command, vec!["bin/worker", "--fast"]);
    }
}
