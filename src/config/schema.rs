//! Configuration schema definitions for nitra.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The configuration is an immutable input to the
//! distribution engine: it is validated here and never re-checked by the
//! coordinators.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── NitraConfig            - Core settings (processes, environment, frameworks)
//! ├── Vec<SlaveConfig>       - Remote hosts and their capacity
//! ├── PrepareConfig          - Per-slot environment preparation (schema, migrations)
//! └── FrameworkConfig map    - Worker commands and custom framework definitions
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for nitra.
///
/// # TOML Structure
///
/// ```toml
/// [nitra]
/// process_count = 8
/// environment = "nitra"
/// frameworks = ["rspec", "cucumber"]
///
/// [[slaves]]
/// host = "ci-box-2"
/// capacity = 16
///
/// [prepare]
/// load_schema = true
///
/// [frameworks.rspec]
/// worker_command = "bundle exec nitra-worker rspec"
/// ```
///
/// # Example
///
/// ```
/// use nitra::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [nitra]
///     process_count = 2
/// "#).unwrap();
/// assert_eq!(config.nitra.environment, "nitra");
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core nitra settings.
    #[serde(default)]
    pub nitra: NitraConfig,

    /// Remote hosts that run a runner of their own.
    #[serde(default)]
    pub slaves: Vec<SlaveConfig>,

    /// One-time environment preparation done by every runner.
    #[serde(default)]
    pub prepare: PrepareConfig,

    /// Framework overrides, keyed by framework name.
    ///
    /// Keys other than the built-in `rspec` and `cucumber` define custom
    /// frameworks.
    #[serde(default)]
    pub frameworks: BTreeMap<String, FrameworkConfig>,
}

/// Core nitra execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `process_count` | number of available CPUs |
/// | `environment` | `"nitra"` |
/// | `frameworks` | `["rspec"]` |
/// | `history_file` | `log/nitra_filemap.json` |
/// | `debug`, `quiet`, `print_failures` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NitraConfig {
    /// Number of local workers. Zero disables the local runner, leaving all
    /// work to slaves.
    #[serde(default = "default_process_count")]
    pub process_count: usize,

    /// Exported as `RAILS_ENV` to every helper and worker process.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Frameworks whose files are discovered automatically.
    #[serde(default = "default_frameworks")]
    pub frameworks: Vec<String>,

    /// Where per-file run times are persisted between runs.
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,

    /// Command that starts a runner in stdio mode.
    ///
    /// Defaults to the running executable with the `runner` subcommand.
    pub runner_command: Option<String>,

    /// Surface `debug`/`stdout` diagnostics from runners and workers.
    #[serde(default)]
    pub debug: bool,

    /// Suppress the progress bar and timing line.
    #[serde(default)]
    pub quiet: bool,

    /// Print the output of each failing file as soon as it completes.
    #[serde(default)]
    pub print_failures: bool,
}

impl Default for NitraConfig {
    fn default() -> Self {
        Self {
            process_count: default_process_count(),
            environment: default_environment(),
            frameworks: default_frameworks(),
            history_file: default_history_file(),
            runner_command: None,
            debug: false,
            quiet: false,
            print_failures: false,
        }
    }
}

fn default_process_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_environment() -> String {
    "nitra".to_string()
}

fn default_frameworks() -> Vec<String> {
    vec!["rspec".to_string()]
}

fn default_history_file() -> PathBuf {
    PathBuf::from("log/nitra_filemap.json")
}

/// A remote host that runs its own runner.
///
/// # Example
///
/// ```toml
/// [[slaves]]
/// host = "ci-box-2"
/// capacity = 16
/// command = "cd /srv/app && bundle exec nitra runner"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SlaveConfig {
    /// Host name passed to ssh.
    pub host: String,

    /// Number of workers the remote runner keeps alive.
    #[serde(default = "default_slave_capacity")]
    pub capacity: usize,

    /// Remote command that starts a runner in stdio mode.
    ///
    /// Default: `nitra runner`
    pub command: Option<String>,
}

fn default_slave_capacity() -> usize {
    1
}

impl SlaveConfig {
    /// Parses the `host[:capacity]` form accepted on the command line.
    ///
    /// # Example
    ///
    /// ```
    /// use nitra::config::SlaveConfig;
    ///
    /// let slave = SlaveConfig::parse("ci-box-2:8").unwrap();
    /// assert_eq!(slave.host, "ci-box-2");
    /// assert_eq!(slave.capacity, 8);
    /// ```
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let (host, capacity) = match spec.rsplit_once(':') {
            Some((host, capacity)) => {
                let capacity = capacity
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid slave capacity in '{}': {}", spec, e))?;
                (host, capacity)
            }
            None => (spec, default_slave_capacity()),
        };

        if host.is_empty() {
            anyhow::bail!("Slave host is empty in '{}'", spec);
        }

        Ok(Self {
            host: host.to_string(),
            capacity,
            command: None,
        })
    }
}

/// Environment preparation run once per worker slot before workers start.
///
/// Each enabled step runs in parallel for slots `1..=process_count` with
/// `TEST_ENV_NUMBER` set to the slot number.
///
/// # Example
///
/// ```toml
/// [prepare]
/// load_schema = true
/// migrate = false
/// commands = ["bin/seed-fixtures"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PrepareConfig {
    /// Drop, create and load the schema of each slot's database.
    #[serde(default)]
    pub load_schema: bool,

    /// Run pending migrations on each slot's database.
    #[serde(default)]
    pub migrate: bool,

    /// Additional shell commands run for every slot.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl PrepareConfig {
    /// Returns `true` if any preparation step is enabled.
    pub fn is_enabled(&self) -> bool {
        self.load_schema || self.migrate || !self.commands.is_empty()
    }
}

/// Settings for one framework.
///
/// For the built-in `rspec` and `cucumber` frameworks every field is an
/// optional override. A custom framework must set at least `pattern` and
/// `worker_command`.
///
/// # Example
///
/// ```toml
/// [frameworks.minitest]
/// order = 2
/// root = "test"
/// pattern = "_test\\.rb$"
/// worker_command = "bundle exec nitra-worker minitest"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FrameworkConfig {
    /// Command that starts one worker speaking the worker protocol on stdio.
    pub worker_command: Option<String>,

    /// Command run once per runner before workers start.
    pub setup_command: Option<String>,

    /// Scheduling priority; lower runs first.
    pub order: Option<i32>,

    /// Directory searched for files.
    pub root: Option<PathBuf>,

    /// Regular expression a filename must match to belong to this framework.
    pub pattern: Option<String>,

    /// Contents of the bootstrap file handed to workers for preloading.
    pub minimal_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.nitra.environment, "nitra");
        assert_eq!(config.nitra.frameworks, vec!["rspec"]);
        assert!(config.nitra.process_count >= 1);
        assert!(config.slaves.is_empty());
        assert!(!config.prepare.is_enabled());
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [nitra]
            process_count = 3
            environment = "ci"
            frameworks = ["rspec", "cucumber"]
            history_file = "tmp/history.json"
            debug = true

            [[slaves]]
            host = "box-a"
            capacity = 4

            [[slaves]]
            host = "box-b"
            command = "nitra-remote runner"

            [prepare]
            migrate = true

            [frameworks.rspec]
            worker_command = "bin/rspec-worker"

            [frameworks.minitest]
            order = 2
            pattern = "_test\\.rb$"
            worker_command = "bin/minitest-worker"
            "#,
        )
        .unwrap();

        assert_eq!(config.nitra.process_count, 3);
        assert_eq!(config.nitra.history_file, PathBuf::from("tmp/history.json"));
        assert_eq!(config.slaves.len(), 2);
        assert_eq!(config.slaves[1].capacity, 1);
        assert_eq!(
            config.slaves[1].command.as_deref(),
            Some("nitra-remote runner")
        );
        assert!(config.prepare.migrate);
        assert!(config.prepare.is_enabled());
        assert_eq!(config.frameworks["minitest"].order, Some(2));
        assert_eq!(
            config.frameworks["rspec"].worker_command.as_deref(),
            Some("bin/rspec-worker")
        );
    }

    #[test]
    fn test_slave_spec_parsing() {
        let slave = SlaveConfig::parse("box-a").unwrap();
        assert_eq!(slave.capacity, 1);

        let slave = SlaveConfig::parse("user@box-b:12").unwrap();
        assert_eq!(slave.host, "user@box-b");
        assert_eq!(slave.capacity, 12);

        assert!(SlaveConfig::parse("box-c:many").is_err());
        assert!(SlaveConfig::parse(":3").is_err());
    }
}
