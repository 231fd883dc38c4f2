//! nitra: A distributed test runner.
//!
//! This crate spreads the files of a large test suite across a pool of local
//! worker processes and any number of remote worker hosts. Expensive framework
//! environments are loaded once per worker and amortized over many files, and
//! files are handed out longest-expected-first using run times recorded by the
//! previous run.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Channel**: Line-delimited JSON message transport between processes
//! - **Master**: Owns the global file queue and aggregates results
//! - **Runner**: Per-host coordinator that manages a pool of workers
//! - **Framework**: Pluggable shims that discover and classify test files
//! - **History**: Persisted per-file run times that seed the next schedule
//!
//! ```text
//!   Master ──── Channel ──── Runner (local "A") ──── Channel ──── Worker 0..n
//!     │
//!     └──────── Channel ──── Runner (slave "B") ──── Channel ──── Worker 0..n
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nitra::config::load_config;
//! use nitra::framework::FrameworkRegistry;
//! use nitra::master::{Master, ProcessLauncher};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("nitra.toml"))?;
//!     let registry = FrameworkRegistry::from_config(&config.frameworks)?;
//!     let launcher = ProcessLauncher::current_exe(config.nitra.runner_command.as_deref())?;
//!
//!     let mut master = Master::new(config, registry, launcher);
//!     if let Some(summary) = master.run(|progress, _| println!("{}", progress.files_completed)).await? {
//!         std::process::exit(summary.exit_code());
//!     }
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod file;
pub mod framework;
pub mod history;
pub mod master;
pub mod process;
pub mod progress;
pub mod protocol;
pub mod report;
pub mod runner;
pub mod signal;

// Re-export commonly used types
pub use channel::Channel;
pub use config::{Config, load_config};
pub use framework::{FrameworkRegistry, FrameworkShim};
pub use master::{Master, RunSummary};
pub use progress::Progress;
pub use protocol::{FileResult, Message};
pub use runner::Runner;
