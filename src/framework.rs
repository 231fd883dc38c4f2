//! Test framework shims and their registry.
//!
//! A framework shim describes one test-framework family: how to find its
//! files, how to recognize one of its files by name, how to start a worker
//! with its environment loaded, and how to read the summary line it prints.
//!
//! # Built-in Frameworks
//!
//! | Shim | Order | Files |
//! |------|-------|-------|
//! | [`rspec::RspecShim`] | 0 | `spec/**/*_spec.rb` |
//! | [`cucumber::CucumberShim`] | 1 | `features/**/*.feature` |
//! | [`custom::CustomShim`] | configured | configured root and pattern |
//!
//! Lower order is scheduled first, so a run works through all rspec files
//! before the queue reaches cucumber and workers switch environments.
//!
//! # Registry
//!
//! [`FrameworkRegistry`] is built once at startup from the built-ins plus
//! any `[frameworks.<name>]` sections, and looked up by name. Every test file
//! must belong to exactly one registered framework.

pub mod cucumber;
pub mod custom;
pub mod rspec;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::FrameworkConfig;
use crate::process::Command;

pub use cucumber::CucumberShim;
pub use custom::CustomShim;
pub use rspec::RspecShim;

/// Result type for framework operations.
pub type FrameworkResult<T> = Result<T, FrameworkError>;

/// Errors that can occur while classifying files or loading frameworks.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    /// No registered framework claims the file.
    #[error("No framework matches {0}")]
    Unmatched(String),

    /// More than one framework claims the file.
    #[error("{filename} matches several frameworks: {}", candidates.join(", "))]
    Ambiguous {
        filename: String,
        candidates: Vec<String>,
    },

    /// A framework name that is not registered.
    #[error("Unknown framework: {0}")]
    Unknown(String),

    /// A `[frameworks.<name>]` section that cannot be used.
    #[error("Invalid configuration for framework {framework}: {reason}")]
    InvalidConfig { framework: String, reason: String },

    /// The framework's setup command failed.
    #[error("Loading the {framework} environment failed:\n{output}")]
    SetupFailed { framework: String, output: String },

    /// I/O error reading files or directories.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Example and failure counts read from a framework's summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub example_count: u64,
    pub failure_count: u64,
}

/// How a framework's processes are started.
#[derive(Debug, Clone, PartialEq)]
pub struct ShimCommands {
    /// Argument vector that starts one worker.
    pub worker_command: Vec<String>,

    /// Shell command run once per runner to load the environment.
    pub setup_command: Option<String>,
}

impl ShimCommands {
    /// Resolves the configured commands, falling back to `default_worker`.
    pub fn from_config(
        framework: &str,
        config: &FrameworkConfig,
        default_worker: &[&str],
    ) -> FrameworkResult<Self> {
        let worker_command = match &config.worker_command {
            Some(line) => {
                shell_words::split(line).map_err(|e| FrameworkError::InvalidConfig {
                    framework: framework.to_string(),
                    reason: format!("worker_command: {}", e),
                })?
            }
            None => default_worker.iter().map(|s| s.to_string()).collect(),
        };

        if worker_command.is_empty() {
            return Err(FrameworkError::InvalidConfig {
                framework: framework.to_string(),
                reason: "worker_command is empty".to_string(),
            });
        }

        Ok(Self {
            worker_command,
            setup_command: config.setup_command.clone(),
        })
    }
}

/// One test-framework family.
///
/// # Example Implementation
///
/// ```no_run
/// use async_trait::async_trait;
/// use nitra::framework::*;
/// use std::path::Path;
///
/// #[derive(Debug)]
/// struct Minitest { commands: ShimCommands }
///
/// #[async_trait]
/// impl FrameworkShim for Minitest {
///     fn name(&self) -> &str { "minitest" }
///     fn order(&self) -> i32 { 2 }
///     fn root(&self) -> &Path { Path::new("test") }
///     fn matches(&self, filename: &str) -> bool { filename.ends_with("_test.rb") }
///     fn minimal_file(&self) -> &str { "require 'test_helper'\n" }
///     fn fixture_suffix(&self) -> &str { "_test.rb" }
///     fn commands(&self) -> &ShimCommands { &self.commands }
/// }
/// ```
#[async_trait]
pub trait FrameworkShim: Send + Sync + std::fmt::Debug {
    /// Registry key and the framework name workers report in `ready`.
    fn name(&self) -> &str;

    /// Scheduling priority; lower is scheduled first.
    fn order(&self) -> i32;

    /// Directory searched by [`discover`](Self::discover).
    fn root(&self) -> &Path;

    /// Whether `filename` belongs to this framework.
    fn matches(&self, filename: &str) -> bool;

    /// Smallest file that makes a worker load the whole environment.
    fn minimal_file(&self) -> &str;

    /// File name suffix the framework requires for [`minimal_file`](Self::minimal_file).
    fn fixture_suffix(&self) -> &str;

    /// Worker and setup commands.
    fn commands(&self) -> &ShimCommands;

    /// Reads example/failure counts from a file's output.
    fn summarize(&self, _output: &str) -> Option<Summary> {
        None
    }

    /// Finds this framework's files under [`root`](Self::root), largest first.
    fn discover(&self) -> FrameworkResult<Vec<String>> {
        discover_files(self.root(), &|filename| self.matches(filename))
    }

    /// Loads the framework environment once, returning any captured output.
    async fn load_environment(&self, environment: &str) -> FrameworkResult<Option<String>> {
        match &self.commands().setup_command {
            Some(line) => run_setup(self.name(), line, environment).await.map(Some),
            None => Ok(None),
        }
    }
}

/// The set of frameworks known to this run, ordered by priority.
#[derive(Debug, Clone)]
pub struct FrameworkRegistry {
    shims: Vec<Arc<dyn FrameworkShim>>,
}

impl FrameworkRegistry {
    /// Registry with the built-in frameworks and their default commands.
    pub fn builtin() -> Self {
        Self::from_shims(vec![
            Arc::new(RspecShim::default()),
            Arc::new(CucumberShim::default()),
        ])
    }

    /// Builds the registry from `[frameworks.<name>]` sections.
    ///
    /// Sections named after a built-in override it; any other name defines a
    /// custom framework.
    pub fn from_config(overrides: &BTreeMap<String, FrameworkConfig>) -> FrameworkResult<Self> {
        let empty = FrameworkConfig::default();
        let mut shims: Vec<Arc<dyn FrameworkShim>> = vec![
            Arc::new(RspecShim::from_config(
                overrides.get(rspec::NAME).unwrap_or(&empty),
            )?),
            Arc::new(CucumberShim::from_config(
                overrides.get(cucumber::NAME).unwrap_or(&empty),
            )?),
        ];

        for (name, config) in overrides {
            if name != rspec::NAME && name != cucumber::NAME {
                shims.push(Arc::new(CustomShim::from_config(name, config)?));
            }
        }

        Ok(Self::from_shims(shims))
    }

    /// Registry over an explicit set of shims.
    pub fn from_shims(mut shims: Vec<Arc<dyn FrameworkShim>>) -> Self {
        shims.sort_by(|a, b| a.order().cmp(&b.order()).then_with(|| a.name().cmp(b.name())));
        Self { shims }
    }

    /// Looks a framework up by name.
    pub fn get(&self, name: &str) -> FrameworkResult<&Arc<dyn FrameworkShim>> {
        self.shims
            .iter()
            .find(|shim| shim.name() == name)
            .ok_or_else(|| FrameworkError::Unknown(name.to_string()))
    }

    /// Returns the single framework that claims `filename`.
    pub fn shim_for_file(&self, filename: &str) -> FrameworkResult<&Arc<dyn FrameworkShim>> {
        let mut matching = self.shims.iter().filter(|shim| shim.matches(filename));

        let first = matching
            .next()
            .ok_or_else(|| FrameworkError::Unmatched(filename.to_string()))?;

        let rest: Vec<_> = matching.collect();
        if rest.is_empty() {
            Ok(first)
        } else {
            Err(FrameworkError::Ambiguous {
                filename: filename.to_string(),
                candidates: std::iter::once(first)
                    .chain(rest)
                    .map(|shim| shim.name().to_string())
                    .collect(),
            })
        }
    }

    /// Tries each framework's summary pattern in priority order.
    pub fn summarize(&self, output: &str) -> Option<Summary> {
        self.shims.iter().find_map(|shim| shim.summarize(output))
    }

    /// Iterates over the registered frameworks in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn FrameworkShim>> {
        self.shims.iter()
    }
}

/// Recursively collects files under `root` accepted by `matches`.
///
/// A missing root yields no files. The result is sorted by size, largest
/// first, so the biggest files of a framework are handed out first even
/// before any run history exists.
pub fn discover_files(root: &Path, matches: &dyn Fn(&str) -> bool) -> FrameworkResult<Vec<String>> {
    if !root.is_dir() {
        debug!("Discovery root {} does not exist", root.display());
        return Ok(Vec::new());
    }

    let mut found: Vec<(u64, String)> = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let filename = path.to_string_lossy().into_owned();
                if matches(&filename) {
                    found.push((entry.metadata()?.len(), filename));
                }
            }
        }
    }

    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(found.into_iter().map(|(_, filename)| filename).collect())
}

async fn run_setup(framework: &str, line: &str, environment: &str) -> FrameworkResult<String> {
    let command = Command::parse(line)
        .map_err(|e| FrameworkError::InvalidConfig {
            framework: framework.to_string(),
            reason: e.to_string(),
        })?
        .env("TEST_ENV_NUMBER", "1")
        .env("RAILS_ENV", environment);

    debug!("Loading {} environment: {}", framework, command.to_shell_string());

    let output = command.to_tokio().output().await?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(text)
    } else {
        Err(FrameworkError::SetupFailed {
            framework: framework.to_string(),
            output: text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_priority_order() {
        let registry = FrameworkRegistry::builtin();
        let names: Vec<_> = registry.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["rspec", "cucumber"]);
    }

    #[test]
    fn test_classification() {
        let registry = FrameworkRegistry::builtin();

        assert_eq!(
            registry.shim_for_file("spec/models/user_spec.rb").unwrap().name(),
            "rspec"
        );
        assert_eq!(
            registry.shim_for_file("features/login.feature").unwrap().name(),
            "cucumber"
        );
        assert!(matches!(
            registry.shim_for_file("lib/user.rb"),
            Err(FrameworkError::Unmatched(_))
        ));
        assert!(matches!(
            registry.shim_for_file("features/user_spec.feature"),
            Err(FrameworkError::Ambiguous { .. })
        ));
    }

    #[test]
    fn test_custom_framework_registration() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "minitest".to_string(),
            FrameworkConfig {
                order: Some(2),
                pattern: Some(r"_test\.rb$".to_string()),
                worker_command: Some("bin/minitest-worker".to_string()),
                ..Default::default()
            },
        );

        let registry = FrameworkRegistry::from_config(&overrides).unwrap();
        assert_eq!(registry.get("minitest").unwrap().order(), 2);
        assert_eq!(
            registry.shim_for_file("test/user_test.rb").unwrap().name(),
            "minitest"
        );
        assert!(matches!(
            registry.get("jest"),
            Err(FrameworkError::Unknown(_))
        ));
    }

    #[test]
    fn test_override_reorders_builtins() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "cucumber".to_string(),
            FrameworkConfig {
                order: Some(-1),
                ..Default::default()
            },
        );

        let registry = FrameworkRegistry::from_config(&overrides).unwrap();
        assert_eq!(registry.iter().next().unwrap().name(), "cucumber");
    }

    #[test]
    fn test_summarize_tries_each_family() {
        let registry = FrameworkRegistry::builtin();

        assert_eq!(
            registry.summarize("Finished in 0.1 seconds\n3 examples, 1 failure\n"),
            Some(Summary {
                example_count: 3,
                failure_count: 1
            })
        );
        assert_eq!(
            registry.summarize("2 scenarios (1 failed, 1 passed)\n6 steps (1 failed, 5 passed)\n"),
            Some(Summary {
                example_count: 2,
                failure_count: 1
            })
        );
        assert_eq!(registry.summarize("Segmentation fault"), None);
    }

    #[test]
    fn test_discover_files_largest_first() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("models");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("small_spec.rb"), "x").unwrap();
        std::fs::write(nested.join("large_spec.rb"), "x".repeat(100)).unwrap();
        std::fs::write(nested.join("helper.rb"), "x".repeat(500)).unwrap();

        let files = discover_files(dir.path(), &|f| f.contains("_spec")).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("large_spec.rb"));
        assert!(files[1].ends_with("small_spec.rb"));
    }

    #[test]
    fn test_discover_missing_root() {
        let files = discover_files(Path::new("does/not/exist"), &|_| true).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_empty_worker_command_rejected() {
        let config = FrameworkConfig {
            worker_command: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            ShimCommands::from_config("rspec", &config, &["x"]),
            Err(FrameworkError::InvalidConfig { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_environment_runs_setup_command() {
        let config = FrameworkConfig {
            setup_command: Some(r#"sh -c "echo loaded $RAILS_ENV $TEST_ENV_NUMBER""#.to_string()),
            ..Default::default()
        };
        let shim = RspecShim::from_config(&config).unwrap();

        let output = shim.load_environment("ci").await.unwrap();
        assert_eq!(output.as_deref(), Some("loaded ci 1\n"));

        let failing = RspecShim::from_config(&FrameworkConfig {
            setup_command: Some("sh -c 'echo broken; exit 3'".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            failing.load_environment("ci").await,
            Err(FrameworkError::SetupFailed { .. })
        ));
    }
}
