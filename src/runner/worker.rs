//! Starting worker processes.
//!
//! A worker is an external program that loads one framework's environment and
//! then speaks the worker protocol on stdin/stdout:
//!
//! ```text
//! worker → {"command":"ready","framework":"rspec"}
//! runner → {"command":"process","filename":"spec/models/user_spec.rb"}
//! worker → {"command":"result","filename":"spec/models/user_spec.rb","text":"...","return_code":0}
//! worker → {"command":"ready","framework":"rspec"}
//! runner → {"command":"close"}
//! ```
//!
//! [`CommandLauncher`] starts the framework's `worker_command` with:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `NITRA_FRAMEWORK` | framework name |
//! | `NITRA_PRELOAD_FILE` | path of the framework's minimal file, run once to warm up |
//! | `TEST_ENV_NUMBER` | slot number, starting at 1 |
//! | `RAILS_ENV` | configured environment |

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;

use super::RunnerResult;
use crate::framework::FrameworkShim;
use crate::process::{Command, Spawned, spawn_command};

/// What a runner needs started.
#[derive(Debug, Clone, Copy)]
pub struct WorkerRequest<'a> {
    pub runner_id: &'a str,
    pub slot: usize,
    pub shim: &'a dyn FrameworkShim,
    pub environment: &'a str,
}

impl WorkerRequest<'_> {
    /// Diagnostic label, `<runner_id>:<slot>`.
    pub fn label(&self) -> String {
        format!("{}:{}", self.runner_id, self.slot)
    }

    /// Value of `TEST_ENV_NUMBER` for this slot.
    pub fn env_number(&self) -> String {
        (self.slot + 1).to_string()
    }
}

/// Starts workers for a runner.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, request: WorkerRequest<'_>) -> RunnerResult<Spawned>;
}

/// Launches each framework's `worker_command` as a child process.
#[derive(Debug)]
pub struct CommandLauncher {
    fixtures: TempDir,
    written: Mutex<HashSet<String>>,
}

impl CommandLauncher {
    /// Creates a launcher with a private directory for preload fixtures.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            fixtures: tempfile::Builder::new().prefix("nitra-").tempdir()?,
            written: Mutex::new(HashSet::new()),
        })
    }

    fn fixture_for(&self, shim: &dyn FrameworkShim) -> std::io::Result<PathBuf> {
        let path = self
            .fixtures
            .path()
            .join(format!("{}_preload{}", shim.name(), shim.fixture_suffix()));

        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if written.insert(shim.name().to_string()) {
            std::fs::write(&path, shim.minimal_file())?;
        }
        Ok(path)
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, request: WorkerRequest<'_>) -> RunnerResult<Spawned> {
        let fixture = self.fixture_for(request.shim)?;

        let command = Command::from_argv(&request.shim.commands().worker_command)?
            .env("NITRA_FRAMEWORK", request.shim.name())
            .env("NITRA_PRELOAD_FILE", fixture.to_string_lossy())
            .env("TEST_ENV_NUMBER", request.env_number())
            .env("RAILS_ENV", request.environment);

        Ok(spawn_command(request.label(), &command)?)
    }
}
